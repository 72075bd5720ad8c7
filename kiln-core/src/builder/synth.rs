//! Build manifest synthesis with live-update ordering.
//!
//! Runs gated on trigger files are hoisted in front of the bulk copy of the
//! build context, together with just the files they depend on. Editing any
//! other file then only invalidates the layers after `ADD . /`, so the
//! expensive dependency steps stay cached.
//!
//! Only a leading block of triggered runs is hoisted. A triggered run that
//! follows an untriggered one is treated like any other remaining run and
//! executes unconditionally after the context copy.

use crate::builder::manifest::{BuildManifest, BuildMode, Labels};
use crate::error::{KilnError, Result};
use crate::model::{
    create_run_matcher, filter_mappings, missing_local_paths, syncs_to_path_mappings, Cmd,
    PathMapping, Run, SyncRule,
};
use std::collections::BTreeMap;
use tracing::debug;

/// A synthesized manifest and the mappings whose files make up its context.
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub manifest: BuildManifest,
    pub mappings: Vec<PathMapping>,
}

/// Turns base instructions, syncs and runs into a concrete build manifest.
#[derive(Debug, Clone, Default)]
pub struct ManifestSynthesizer {
    /// Labels attached to every manifest after the build mode.
    extra_labels: BTreeMap<String, String>,
}

impl ManifestSynthesizer {
    pub fn new(extra_labels: BTreeMap<String, String>) -> Self {
        Self { extra_labels }
    }

    /// Synthesize a full build from `base`.
    pub fn synthesize(
        &self,
        base: BuildManifest,
        runs: &[Run],
        syncs: &[SyncRule],
        entrypoint: Option<&Cmd>,
    ) -> Result<Synthesized> {
        let mappings = syncs_to_path_mappings(syncs)?;
        let mut manifest = base;

        let consumed = self.add_conditional_runs(&mut manifest, runs, &mappings)?;

        manifest.add_all();
        for run in &runs[consumed..] {
            manifest.run(&run.cmd);
        }

        if let Some(entrypoint) = entrypoint.filter(|cmd| !cmd.is_empty()) {
            manifest.entrypoint(entrypoint);
        }

        self.apply_labels(&mut manifest, BuildMode::Scratch);
        Ok(Synthesized { manifest, mappings })
    }

    /// Synthesize an update on top of `existing`: copy the synced files,
    /// delete the ones removed locally, then run every step.
    pub fn synthesize_update(
        &self,
        existing: &str,
        runs: &[Run],
        syncs: &[SyncRule],
    ) -> Result<Synthesized> {
        let mappings = syncs_to_path_mappings(syncs)?;
        let mut manifest = BuildManifest::from_image(existing);

        manifest.add_all();
        let (missing, _) = missing_local_paths(&mappings)?;
        let to_remove: Vec<&str> = missing.iter().map(PathMapping::container_path).collect();
        manifest.rm_paths(&to_remove);

        for run in runs {
            manifest.run(&run.cmd);
        }

        self.apply_labels(&mut manifest, BuildMode::Existing);
        Ok(Synthesized { manifest, mappings })
    }

    /// Emit the leading triggered runs with their inputs. Returns how many
    /// runs were consumed.
    fn add_conditional_runs(
        &self,
        manifest: &mut BuildManifest,
        runs: &[Run],
        mappings: &[PathMapping],
    ) -> Result<usize> {
        let mut consumed = 0;

        for run in runs {
            if run.triggers.is_empty() {
                break;
            }

            let matcher = create_run_matcher(run)?;
            let inputs = filter_mappings(mappings, matcher.as_ref())?;
            if inputs.is_empty() {
                return Err(KilnError::NoInputsForRun { cmd: run.cmd.to_string() });
            }

            debug!(cmd = %run.cmd, inputs = inputs.len(), "Hoisting conditional run");

            // The context root is the image root, so source and destination agree.
            for input in &inputs {
                manifest.copy(input.container_path(), input.container_path());
            }
            manifest.run(&run.cmd);
            consumed += 1;
        }

        Ok(consumed)
    }

    fn apply_labels(&self, manifest: &mut BuildManifest, mode: BuildMode) {
        let mut labels = Labels::for_mode(mode);
        labels.merge_extra(&self.extra_labels);
        manifest.with_labels(&labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PathSet;
    use std::path::Path;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/index.js"), "").unwrap();
        temp
    }

    fn npm_install(dir: &Path) -> Run {
        Run::new(Cmd::shell("npm install")).with_triggers(PathSet::new(["package.json"], dir))
    }

    #[test]
    fn test_conditional_run_hoisted() {
        let temp = project();
        let syncs = vec![SyncRule::new(temp.path(), "/")];
        let runs = vec![npm_install(temp.path()), Run::new(Cmd::shell("npm build"))];

        let out = ManifestSynthesizer::default()
            .synthesize(BuildManifest::new("FROM node:18"), &runs, &syncs, None)
            .unwrap();

        assert_eq!(
            out.manifest.instructions(),
            &[
                "FROM node:18",
                "COPY /package.json /package.json",
                "RUN npm install",
                "ADD . /",
                "RUN npm build",
                "LABEL \"kiln.buildMode\"=\"scratch\"",
            ]
        );
        assert_eq!(out.mappings.len(), 1);
    }

    #[test]
    fn test_no_conditional_runs_copies_context_first() {
        let temp = project();
        let syncs = vec![SyncRule::new(temp.path(), "/app")];
        let runs = vec![Run::new(Cmd::shell("make")), Run::new(Cmd::shell("make test"))];

        let out = ManifestSynthesizer::default()
            .synthesize(BuildManifest::new("FROM alpine"), &runs, &syncs, None)
            .unwrap();

        let body = &out.manifest.instructions()[1..];
        assert_eq!(body[0], "ADD . /");
        assert_eq!(&body[1..3], &["RUN make", "RUN make test"]);
    }

    #[test]
    fn test_missing_trigger_names_command() {
        let temp = project();
        let syncs = vec![SyncRule::new(temp.path(), "/")];
        let runs = vec![Run::new(Cmd::shell("bundle install"))
            .with_triggers(PathSet::new(["Gemfile"], temp.path()))];

        let err = ManifestSynthesizer::default()
            .synthesize(BuildManifest::new("FROM ruby"), &runs, &syncs, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "No inputs for run: bundle install");
    }

    #[test]
    fn test_interleaved_trigger_runs_after_context() {
        let temp = project();
        let syncs = vec![SyncRule::new(temp.path(), "/")];
        let runs = vec![Run::new(Cmd::shell("echo first")), npm_install(temp.path())];

        let out = ManifestSynthesizer::default()
            .synthesize(BuildManifest::new("FROM node"), &runs, &syncs, None)
            .unwrap();

        assert_eq!(
            &out.manifest.instructions()[1..4],
            &["ADD . /", "RUN echo first", "RUN npm install"]
        );
    }

    #[test]
    fn test_entrypoint_and_extra_labels() {
        let temp = project();
        let syncs = vec![SyncRule::new(temp.path(), "/")];
        let extra = [("owner".to_string(), "web".to_string())].into_iter().collect();

        let entrypoint = Cmd::new(["node", "."]);
        let out = ManifestSynthesizer::new(extra)
            .synthesize(BuildManifest::new("FROM node"), &[], &syncs, Some(&entrypoint))
            .unwrap();

        assert_eq!(
            &out.manifest.instructions()[1..],
            &[
                "ADD . /",
                r#"ENTRYPOINT ["node","."]"#,
                "LABEL \"kiln.buildMode\"=\"scratch\"",
                "LABEL \"owner\"=\"web\"",
            ]
        );
    }

    #[test]
    fn test_empty_entrypoint_ignored() {
        let temp = project();
        let syncs = vec![SyncRule::new(temp.path(), "/")];
        let out = ManifestSynthesizer::default()
            .synthesize(BuildManifest::new("FROM node"), &[], &syncs, Some(&Cmd::default()))
            .unwrap();
        assert!(!out.manifest.to_string().contains("ENTRYPOINT"));
    }

    #[test]
    fn test_update_removes_deleted_files() {
        let temp = project();
        let syncs = vec![
            SyncRule::new(temp.path().join("src"), "/src"),
            SyncRule::new(temp.path().join("deleted.txt"), "/deleted.txt"),
        ];
        let runs = vec![Run::new(Cmd::shell("npm build"))];

        let out = ManifestSynthesizer::default()
            .synthesize_update("registry.local/app:kiln-0123456789abcdef", &runs, &syncs)
            .unwrap();

        assert_eq!(
            out.manifest.instructions(),
            &[
                "FROM registry.local/app:kiln-0123456789abcdef",
                "ADD . /",
                "RUN rm -rf '/deleted.txt'",
                "RUN npm build",
                "LABEL \"kiln.buildMode\"=\"existing\"",
            ]
        );
    }
}
