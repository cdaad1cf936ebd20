//! Merging of the built-in build pipeline list with user overrides.
//!
//! The result is rendered into the `build-pipeline-config` ConfigMap that
//! pipeline runs consume. The merge is a pure function over copies of its
//! inputs: the built-in defaults are never mutated.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ensure, Snafu};

/// ConfigMap holding the merged pipeline configuration.
pub const PIPELINE_CONFIG_MAP_NAME: &str = "build-pipeline-config";
/// Key inside [`PIPELINE_CONFIG_MAP_NAME`] holding the rendered YAML payload.
pub const PIPELINE_CONFIG_KEY: &str = "config.yaml";

/// Pipeline used when the cluster admin does not pick one explicitly.
pub const DEFAULT_PIPELINE_NAME: &str = "docker-build-oci-ta";

#[derive(Debug, Snafu, PartialEq)]
pub enum Error {
    #[snafu(display(
        "default pipeline {name:?} not found, available: [{}]",
        available.join(", ")
    ))]
    DefaultPipelineNotFound {
        name: String,
        available: Vec<String>,
    },

    #[snafu(display("pipeline override {name:?} has no bundle and is not marked removed"))]
    MissingBundle { name: String },
}

/// A named pipeline and the Tekton bundle it resolves to.
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    pub name: String,
    pub bundle: String,
}

/// A single user-provided pipeline override, applied in list order.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineOverride {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    /// Delete any entry with this name instead of adding one.
    #[serde(default)]
    pub removed: bool,
}

/// Pipeline-related knobs of the `KonfluxBuildService` spec.
#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    /// Overrides applied on top of the built-in pipeline list, in order.
    #[serde(default)]
    pub pipelines: Vec<PipelineOverride>,
    /// Discard the built-in pipeline list and start from an empty one.
    #[serde(default)]
    pub remove_defaults: bool,
    /// Name of the pipeline used when none is requested. Must exist in the
    /// final merged list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_pipeline_name: Option<String>,
}

/// The final merged pipeline list plus the validated default pipeline name.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PipelineSelection {
    pub pipelines: Vec<PipelineRef>,
    pub default_pipeline_name: String,
}

/// The pipelines shipped with the platform.
pub fn default_pipelines() -> Vec<PipelineRef> {
    [
        ("fbc-builder", "quay.io/konflux-ci/tekton-catalog/pipeline-fbc-builder:devel"),
        ("docker-build", "quay.io/konflux-ci/tekton-catalog/pipeline-docker-build:devel"),
        (
            "docker-build-oci-ta",
            "quay.io/konflux-ci/tekton-catalog/pipeline-docker-build-oci-ta:devel",
        ),
        (
            "docker-build-multi-platform-oci-ta",
            "quay.io/konflux-ci/tekton-catalog/pipeline-docker-build-multi-platform-oci-ta:devel",
        ),
    ]
    .into_iter()
    .map(|(name, bundle)| PipelineRef {
        name: name.to_string(),
        bundle: bundle.to_string(),
    })
    .collect()
}

/// Merges `settings` over `defaults` and resolves the default pipeline name.
///
/// Overrides are applied in the order given, so removing a name and then
/// re-adding it nets out to "added". The requested default pipeline name must
/// exist in the merged list; an empty final list keeps the configured name
/// without validation so the `default-pipeline-name` key survives.
pub fn merge_pipelines(
    defaults: &[PipelineRef],
    settings: &PipelineSettings,
) -> Result<PipelineSelection, Error> {
    let mut merged: Vec<PipelineRef> = if settings.remove_defaults {
        Vec::new()
    } else {
        defaults.to_vec()
    };

    for entry in &settings.pipelines {
        if entry.removed {
            merged.retain(|p| p.name != entry.name);
            continue;
        }
        let bundle = entry.bundle.clone().ok_or_else(|| Error::MissingBundle {
            name: entry.name.clone(),
        })?;
        match merged.iter_mut().find(|p| p.name == entry.name) {
            Some(existing) => existing.bundle = bundle,
            None => merged.push(PipelineRef {
                name: entry.name.clone(),
                bundle,
            }),
        }
    }

    let default_pipeline_name = settings
        .default_pipeline_name
        .clone()
        .unwrap_or_else(|| DEFAULT_PIPELINE_NAME.to_string());

    if !merged.is_empty() {
        ensure!(
            merged.iter().any(|p| p.name == default_pipeline_name),
            DefaultPipelineNotFoundSnafu {
                name: default_pipeline_name,
                available: merged.iter().map(|p| p.name.clone()).collect::<Vec<_>>(),
            }
        );
    }

    Ok(PipelineSelection {
        pipelines: merged,
        default_pipeline_name,
    })
}

#[derive(Serialize)]
struct PipelineConfigFile<'a> {
    #[serde(rename = "default-pipeline-name")]
    default_pipeline_name: &'a str,
    pipelines: &'a [PipelineRef],
}

/// Renders the merged selection into the `config.yaml` payload.
pub fn render_pipeline_config(selection: &PipelineSelection) -> Result<String, serde_yaml::Error> {
    serde_yaml::to_string(&PipelineConfigFile {
        default_pipeline_name: &selection.default_pipeline_name,
        pipelines: &selection.pipelines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn pipeline(name: &str, bundle: &str) -> PipelineRef {
        PipelineRef {
            name: name.to_string(),
            bundle: bundle.to_string(),
        }
    }

    fn upsert(name: &str, bundle: &str) -> PipelineOverride {
        PipelineOverride {
            name: name.to_string(),
            bundle: Some(bundle.to_string()),
            removed: false,
        }
    }

    fn remove(name: &str) -> PipelineOverride {
        PipelineOverride {
            name: name.to_string(),
            bundle: None,
            removed: true,
        }
    }

    fn test_defaults() -> Vec<PipelineRef> {
        vec![
            pipeline("fbc-builder", "quay.io/test/fbc:1"),
            pipeline("docker-build-oci-ta", "quay.io/test/oci-ta:1"),
        ]
    }

    #[test]
    fn defaults_pass_through_untouched() {
        let defaults = test_defaults();
        let selection = merge_pipelines(&defaults, &PipelineSettings::default()).unwrap();

        assert_eq!(selection.pipelines, defaults);
        assert_eq!(selection.default_pipeline_name, "docker-build-oci-ta");
    }

    #[test]
    fn merge_never_mutates_the_defaults() {
        let defaults = test_defaults();
        let before = defaults.clone();
        let settings = PipelineSettings {
            pipelines: vec![remove("fbc-builder"), upsert("extra", "quay.io/test/extra:1")],
            remove_defaults: false,
            default_pipeline_name: None,
        };

        merge_pipelines(&defaults, &settings).unwrap();
        assert_eq!(defaults, before);
    }

    #[test]
    fn remove_then_readd_nets_to_added() {
        let settings = PipelineSettings {
            pipelines: vec![
                remove("fbc-builder"),
                upsert("fbc-builder", "quay.io/test/fbc:2"),
            ],
            remove_defaults: false,
            default_pipeline_name: None,
        };

        let selection = merge_pipelines(&test_defaults(), &settings).unwrap();
        let fbc = selection
            .pipelines
            .iter()
            .find(|p| p.name == "fbc-builder")
            .expect("fbc-builder must be present after re-add");
        assert_eq!(fbc.bundle, "quay.io/test/fbc:2");
    }

    #[test]
    fn upsert_replaces_in_place_and_appends() {
        let settings = PipelineSettings {
            pipelines: vec![
                upsert("docker-build-oci-ta", "quay.io/test/oci-ta:2"),
                upsert("extra", "quay.io/test/extra:1"),
            ],
            remove_defaults: false,
            default_pipeline_name: None,
        };

        let selection = merge_pipelines(&test_defaults(), &settings).unwrap();
        assert_eq!(
            selection.pipelines,
            vec![
                pipeline("fbc-builder", "quay.io/test/fbc:1"),
                pipeline("docker-build-oci-ta", "quay.io/test/oci-ta:2"),
                pipeline("extra", "quay.io/test/extra:1"),
            ]
        );
    }

    #[test]
    fn remove_defaults_with_no_overrides_keeps_the_name_key() {
        let settings = PipelineSettings {
            pipelines: vec![],
            remove_defaults: true,
            default_pipeline_name: None,
        };

        let selection = merge_pipelines(&test_defaults(), &settings).unwrap();
        assert!(selection.pipelines.is_empty());
        assert_eq!(selection.default_pipeline_name, "docker-build-oci-ta");

        let rendered = render_pipeline_config(&selection).unwrap();
        assert!(rendered.contains("default-pipeline-name: docker-build-oci-ta"));
    }

    #[rstest]
    #[case::unknown_default(Some("no-such-pipeline"))]
    #[case::removed_default(Some("fbc-builder"))]
    fn default_name_must_exist_in_final_list(#[case] default_name: Option<&str>) {
        let settings = PipelineSettings {
            pipelines: vec![remove("fbc-builder")],
            remove_defaults: false,
            default_pipeline_name: default_name.map(str::to_string),
        };

        let err = merge_pipelines(&test_defaults(), &settings).unwrap_err();
        match err {
            Error::DefaultPipelineNotFound { name, available } => {
                assert_eq!(name, default_name.unwrap());
                assert_eq!(available, vec!["docker-build-oci-ta".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn override_without_bundle_is_rejected() {
        let settings = PipelineSettings {
            pipelines: vec![PipelineOverride {
                name: "fbc-builder".to_string(),
                bundle: None,
                removed: false,
            }],
            remove_defaults: false,
            default_pipeline_name: None,
        };

        assert_eq!(
            merge_pipelines(&test_defaults(), &settings),
            Err(Error::MissingBundle {
                name: "fbc-builder".to_string()
            })
        );
    }

    #[test]
    fn removed_pipeline_is_absent_from_rendered_config() {
        let settings = PipelineSettings {
            pipelines: vec![remove("fbc-builder")],
            remove_defaults: false,
            default_pipeline_name: None,
        };

        let selection = merge_pipelines(&test_defaults(), &settings).unwrap();
        let rendered = render_pipeline_config(&selection).unwrap();

        assert!(!rendered.contains("fbc-builder"));
        assert!(rendered.contains("docker-build-oci-ta"));
        assert!(rendered.contains("default-pipeline-name: docker-build-oci-ta"));
    }
}
