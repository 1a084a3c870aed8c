use crate::command::run_streaming;
use crate::copy::copy_tree;
use crate::BuildError;
use serde::{Deserialize, Serialize};
use slipway_store::{LogKind, Logger};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::info;

/// Named build properties, passed to tools as `-p:Name=Value` or environment.
pub type BuildProperties = BTreeMap<String, String>;

pub const BUILD_TARGETS_PATH: &str = "BuildTargetsPath";
pub const COMMIT_ID: &str = "CommitId";
pub const DEPLOYER: &str = "Deployer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BuilderKind {
    Custom,
    CompiledProject,
    Node,
    Python,
    Static,
    Basic,
}

impl fmt::Display for BuilderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderKind::Custom => write!(f, "custom"),
            BuilderKind::CompiledProject => write!(f, "compiled-project"),
            BuilderKind::Node => write!(f, "node"),
            BuilderKind::Python => write!(f, "python"),
            BuilderKind::Static => write!(f, "static"),
            BuilderKind::Basic => write!(f, "basic"),
        }
    }
}

/// Turns a working copy into an artifact tree.
///
/// `output` exists and is empty when `build` is called. Implementations must
/// not write anywhere else.
pub trait Builder: Send + Sync {
    fn kind(&self) -> BuilderKind;

    fn build(
        &self,
        working_copy: &Path,
        output: &Path,
        properties: &BuildProperties,
        logger: &dyn Logger,
    ) -> Result<BuildOutcome, BuildError>;
}

fn prop<'a>(properties: &'a BuildProperties, key: &str) -> &'a str {
    properties.get(key).map_or("", String::as_str)
}

fn copy_step(src: &Path, output: &Path, logger: &dyn Logger) -> Result<(), BuildError> {
    let n = copy_tree(src, output)?;
    logger.log(
        LogKind::Message,
        &format!("Copied {n} files to {}", output.display()),
    );
    Ok(())
}

fn finish(kind: BuilderKind, started: Instant) -> BuildOutcome {
    let duration = started.elapsed();
    info!(builder = %kind, "build finished in {:.2}s", duration.as_secs_f64());
    BuildOutcome {
        exit_code: 0,
        duration,
    }
}

/// Runs a user-supplied deployment command through `sh -c`.
pub struct CustomBuilder {
    pub command: String,
    pub project_dir: PathBuf,
}

impl Builder for CustomBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Custom
    }

    fn build(
        &self,
        working_copy: &Path,
        output: &Path,
        properties: &BuildProperties,
        logger: &dyn Logger,
    ) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        let source = working_copy.join(&self.project_dir);
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&source)
            .env("DEPLOYMENT_SOURCE", &source)
            .env("DEPLOYMENT_TARGET", output)
            .env("BUILD_TARGETS_PATH", prop(properties, BUILD_TARGETS_PATH))
            .env("SCM_COMMIT_ID", prop(properties, COMMIT_ID))
            .env("DEPLOYER", prop(properties, DEPLOYER));
        run_streaming(cmd, logger)?;
        Ok(finish(self.kind(), started))
    }
}

/// Publishes a `.sln`/`.csproj` project with an external build tool.
pub struct CompiledProjectBuilder {
    pub project: PathBuf,
    pub tool: String,
}

impl Builder for CompiledProjectBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::CompiledProject
    }

    fn build(
        &self,
        working_copy: &Path,
        output: &Path,
        properties: &BuildProperties,
        logger: &dyn Logger,
    ) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        let project = working_copy.join(&self.project);
        let mut cmd = Command::new(&self.tool);
        cmd.arg("publish")
            .arg(&project)
            .arg("--output")
            .arg(output)
            .current_dir(working_copy);
        for (key, value) in properties {
            if key == COMMIT_ID || key == DEPLOYER {
                continue;
            }
            cmd.arg(format!("-p:{key}={value}"));
        }
        run_streaming(cmd, logger)?;
        Ok(finish(self.kind(), started))
    }
}

/// Copies a Node.js site and installs its production dependencies.
pub struct NodeBuilder {
    pub project_dir: PathBuf,
    pub npm: String,
}

fn declares_dependencies(package_json: &Path) -> Result<bool, BuildError> {
    let Ok(raw) = fs::read_to_string(package_json) else {
        return Ok(false);
    };
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
        BuildError::Io(std::io::Error::other(format!(
            "{}: {e}",
            package_json.display()
        )))
    })?;
    Ok(value
        .get("dependencies")
        .and_then(serde_json::Value::as_object)
        .is_some_and(|deps| !deps.is_empty()))
}

impl Builder for NodeBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Node
    }

    fn build(
        &self,
        working_copy: &Path,
        output: &Path,
        _properties: &BuildProperties,
        logger: &dyn Logger,
    ) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        let source = working_copy.join(&self.project_dir);
        copy_step(&source, output, logger)?;
        if declares_dependencies(&output.join("package.json"))? {
            let mut cmd = Command::new(&self.npm);
            cmd.args(["install", "--production"]).current_dir(output);
            run_streaming(cmd, logger)?;
        } else {
            logger.log(LogKind::Message, "No dependencies declared, skipping npm install");
        }
        Ok(finish(self.kind(), started))
    }
}

/// Copies a Python site and vendors its requirements into `site-packages`.
pub struct PythonBuilder {
    pub project_dir: PathBuf,
    pub pip: String,
}

impl Builder for PythonBuilder {
    fn kind(&self) -> BuilderKind {
        BuilderKind::Python
    }

    fn build(
        &self,
        working_copy: &Path,
        output: &Path,
        _properties: &BuildProperties,
        logger: &dyn Logger,
    ) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        let source = working_copy.join(&self.project_dir);
        copy_step(&source, output, logger)?;
        let requirements = fs::read_to_string(output.join("requirements.txt")).unwrap_or_default();
        if requirements.trim().is_empty() {
            logger.log(LogKind::Message, "requirements.txt is empty, skipping pip install");
        } else {
            let mut cmd = Command::new(&self.pip);
            cmd.args(["install", "-r", "requirements.txt", "--target"])
                .arg(output.join("site-packages"))
                .current_dir(output);
            run_streaming(cmd, logger)?;
        }
        Ok(finish(self.kind(), started))
    }
}

/// Plain copy of the working copy. Used for detected static sites and as the
/// fallback when nothing else matches.
pub struct CopyBuilder {
    pub kind: BuilderKind,
    pub project_dir: PathBuf,
}

impl Builder for CopyBuilder {
    fn kind(&self) -> BuilderKind {
        self.kind
    }

    fn build(
        &self,
        working_copy: &Path,
        output: &Path,
        _properties: &BuildProperties,
        logger: &dyn Logger,
    ) -> Result<BuildOutcome, BuildError> {
        let started = Instant::now();
        copy_step(&working_copy.join(&self.project_dir), output, logger)?;
        Ok(finish(self.kind, started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl Logger for Capture {
        fn log(&self, _kind: LogKind, message: &str) {
            self.0.lock().unwrap().push(message.to_owned());
        }

        fn has_errors(&self) -> bool {
            false
        }
    }

    /// A stand-in tool that records its arguments and working directory.
    fn fake_tool(dir: &Path, name: &str) -> String {
        let path = dir.join(name);
        fs::write(
            &path,
            "#!/bin/sh\necho \"$@\" > .invoked\necho \"fake $1\"\n",
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn props() -> BuildProperties {
        let mut p = BuildProperties::new();
        p.insert(BUILD_TARGETS_PATH.to_owned(), "/opt/targets".to_owned());
        p.insert(COMMIT_ID.to_owned(), "abc123".to_owned());
        p.insert(DEPLOYER.to_owned(), "ci".to_owned());
        p
    }

    #[test]
    fn custom_command_sees_deployment_environment() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CustomBuilder {
            command: "echo \"$SCM_COMMIT_ID $DEPLOYER $BUILD_TARGETS_PATH\" > \"$DEPLOYMENT_TARGET/env.txt\"".to_owned(),
            project_dir: PathBuf::new(),
        };
        let outcome = builder
            .build(src.path(), out.path(), &props(), &Capture::default())
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(
            fs::read_to_string(out.path().join("env.txt")).unwrap().trim(),
            "abc123 ci /opt/targets"
        );
    }

    #[test]
    fn custom_command_failure_is_exit_code_error() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CustomBuilder {
            command: "echo failing; exit 7".to_owned(),
            project_dir: PathBuf::new(),
        };
        let logger = Capture::default();
        let err = builder
            .build(src.path(), out.path(), &props(), &logger)
            .unwrap_err();
        assert!(matches!(err, BuildError::ExitCode { code: Some(7), .. }));
        assert!(logger.0.lock().unwrap().iter().any(|l| l == "failing"));
    }

    #[test]
    fn node_installs_only_with_dependencies() {
        let tools = tempfile::tempdir().unwrap();
        let npm = fake_tool(tools.path(), "npm");

        let src = tempfile::tempdir().unwrap();
        fs::write(
            src.path().join("package.json"),
            r#"{"name":"app","dependencies":{"express":"^4"}}"#,
        )
        .unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = NodeBuilder {
            project_dir: PathBuf::new(),
            npm: npm.clone(),
        };
        builder
            .build(src.path(), out.path(), &props(), &Capture::default())
            .unwrap();
        assert_eq!(
            fs::read_to_string(out.path().join(".invoked")).unwrap().trim(),
            "install --production"
        );

        let bare = tempfile::tempdir().unwrap();
        fs::write(bare.path().join("package.json"), r#"{"name":"app"}"#).unwrap();
        let out2 = tempfile::tempdir().unwrap();
        builder
            .build(bare.path(), out2.path(), &props(), &Capture::default())
            .unwrap();
        assert!(!out2.path().join(".invoked").exists());
        assert!(out2.path().join("package.json").exists());
    }

    #[test]
    fn python_vendors_requirements() {
        let tools = tempfile::tempdir().unwrap();
        let pip = fake_tool(tools.path(), "pip");
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("requirements.txt"), "flask\n").unwrap();
        fs::write(src.path().join("app.py"), "print('hi')\n").unwrap();
        let out = tempfile::tempdir().unwrap();

        PythonBuilder {
            project_dir: PathBuf::new(),
            pip,
        }
        .build(src.path(), out.path(), &props(), &Capture::default())
        .unwrap();
        let invoked = fs::read_to_string(out.path().join(".invoked")).unwrap();
        assert!(invoked.starts_with("install -r requirements.txt --target"));
        assert!(invoked.trim().ends_with("site-packages"));
        assert!(out.path().join("app.py").exists());
    }

    #[test]
    fn compiled_project_passes_build_targets_property() {
        let tools = tempfile::tempdir().unwrap();
        let dotnet = fake_tool(tools.path(), "dotnet");
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("App.csproj"), "<Project/>").unwrap();
        let out = tempfile::tempdir().unwrap();

        CompiledProjectBuilder {
            project: PathBuf::from("App.csproj"),
            tool: dotnet,
        }
        .build(src.path(), out.path(), &props(), &Capture::default())
        .unwrap();
        // The fake tool runs in the working copy.
        let invoked = fs::read_to_string(src.path().join(".invoked")).unwrap();
        assert!(invoked.starts_with("publish "));
        assert!(invoked.contains("--output"));
        assert!(invoked.contains("-p:BuildTargetsPath=/opt/targets"));
        assert!(!invoked.contains("CommitId"));
    }

    #[test]
    fn copy_builder_reports_its_kind() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("index.html"), "hi").unwrap();
        let out = tempfile::tempdir().unwrap();
        let builder = CopyBuilder {
            kind: BuilderKind::Static,
            project_dir: PathBuf::new(),
        };
        assert_eq!(builder.kind(), BuilderKind::Static);
        builder
            .build(src.path(), out.path(), &props(), &Capture::default())
            .unwrap();
        assert_eq!(fs::read_to_string(out.path().join("index.html")).unwrap(), "hi");
    }
}
