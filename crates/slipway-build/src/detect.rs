use crate::builder::{
    Builder, BuilderKind, CompiledProjectBuilder, CopyBuilder, CustomBuilder, NodeBuilder,
    PythonBuilder,
};
use crate::BuildError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-repository build configuration file at the working copy root.
pub const DEPLOYMENT_FILE: &str = ".deployment";

const STATIC_DOCUMENTS: &[&str] = &[
    "index.html",
    "index.htm",
    "default.htm",
    "default.html",
    "hostingstart.html",
];

const NODE_MARKERS: &[&str] = &["package.json", "server.js", "app.js"];

/// Builder-related settings supplied by the site configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BuildSettings {
    /// Custom deployment command; overrides every detector.
    pub command: Option<String>,
    /// Project subdirectory (or project file) relative to the working copy.
    pub project: Option<PathBuf>,
    pub build_tool: String,
    pub npm: String,
    pub pip: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            command: None,
            project: None,
            build_tool: "dotnet".to_owned(),
            npm: "npm".to_owned(),
            pip: "pip".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeploymentFileConfig {
    pub command: Option<String>,
    pub project: Option<PathBuf>,
}

/// Parsed `.deployment` file:
///
/// ```toml
/// [config]
/// command = "./deploy.sh"
/// project = "src/site"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeploymentFile {
    pub config: DeploymentFileConfig,
}

impl DeploymentFile {
    pub fn parse(content: &str) -> Result<Self, BuildError> {
        toml::from_str(content).map_err(|e| BuildError::InvalidDeploymentFile(e.to_string()))
    }

    /// Load from `working_copy`, or `None` when the file is absent.
    pub fn load(working_copy: &Path) -> Result<Option<Self>, BuildError> {
        let path = working_copy.join(DEPLOYMENT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Self::parse(&content).map(Some)
    }
}

fn has_any(dir: &Path, names: &[&str]) -> bool {
    names.iter().any(|n| dir.join(n).is_file())
}

fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<String>, BuildError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e.eq_ignore_ascii_case(ext)) {
            found.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    found.sort();
    Ok(found)
}

/// Locate the single `.sln` (preferred) or `.csproj` in `dir`.
fn find_compiled_project(dir: &Path) -> Result<Option<String>, BuildError> {
    for ext in ["sln", "csproj"] {
        let mut candidates = files_with_extension(dir, ext)?;
        match candidates.len() {
            0 => continue,
            1 => return Ok(candidates.pop()),
            _ => {
                return Err(BuildError::AmbiguousProject {
                    dir: dir.to_path_buf(),
                    candidates,
                })
            }
        }
    }
    Ok(None)
}

fn is_python(dir: &Path) -> Result<bool, BuildError> {
    if !dir.join("requirements.txt").is_file() {
        return Ok(false);
    }
    let runtime = fs::read_to_string(dir.join("runtime.txt")).unwrap_or_default();
    if runtime.trim_start().starts_with("python-") {
        return Ok(true);
    }
    Ok(!files_with_extension(dir, "py")?.is_empty())
}

/// Pick the builder for `working_copy`. Detectors run in a fixed order and the
/// first match wins; a plain copy is the fallback.
pub fn select_builder(
    working_copy: &Path,
    settings: &BuildSettings,
) -> Result<Box<dyn Builder>, BuildError> {
    let file = DeploymentFile::load(working_copy)?.unwrap_or_default();
    let project = settings
        .project
        .clone()
        .or(file.config.project)
        .unwrap_or_default();

    let target = working_copy.join(&project);
    if !target.exists() {
        return Err(BuildError::ProjectNotFound(target));
    }

    if let Some(command) = settings.command.clone().or(file.config.command) {
        debug!("custom deployment command: {command}");
        let project_dir = if target.is_dir() {
            project
        } else {
            project.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        return Ok(Box::new(CustomBuilder {
            command,
            project_dir,
        }));
    }

    // An explicit project file is compiled as-is.
    if target.is_file() {
        return Ok(Box::new(CompiledProjectBuilder {
            project,
            tool: settings.build_tool.clone(),
        }));
    }

    if let Some(file_name) = find_compiled_project(&target)? {
        return Ok(Box::new(CompiledProjectBuilder {
            project: project.join(file_name),
            tool: settings.build_tool.clone(),
        }));
    }

    if has_any(&target, NODE_MARKERS) {
        return Ok(Box::new(NodeBuilder {
            project_dir: project,
            npm: settings.npm.clone(),
        }));
    }

    if is_python(&target)? {
        return Ok(Box::new(PythonBuilder {
            project_dir: project,
            pip: settings.pip.clone(),
        }));
    }

    let kind = if has_any(&target, STATIC_DOCUMENTS) {
        BuilderKind::Static
    } else {
        BuilderKind::Basic
    };
    Ok(Box::new(CopyBuilder {
        kind,
        project_dir: project,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for f in files {
            let path = dir.path().join(f);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, "x\n").unwrap();
        }
        dir
    }

    fn kind_of(files: &[&str]) -> BuilderKind {
        let dir = site(files);
        select_builder(dir.path(), &BuildSettings::default())
            .unwrap()
            .kind()
    }

    #[test]
    fn detectors_in_order() {
        assert_eq!(kind_of(&["App.sln", "package.json"]), BuilderKind::CompiledProject);
        assert_eq!(kind_of(&["Web.csproj", "index.html"]), BuilderKind::CompiledProject);
        assert_eq!(kind_of(&["server.js", "requirements.txt", "a.py"]), BuilderKind::Node);
        assert_eq!(kind_of(&["requirements.txt", "app.py", "index.html"]), BuilderKind::Python);
        assert_eq!(kind_of(&["hostingstart.html"]), BuilderKind::Static);
        assert_eq!(kind_of(&["README.md"]), BuilderKind::Basic);
    }

    #[test]
    fn requirements_alone_is_not_python() {
        assert_eq!(kind_of(&["requirements.txt"]), BuilderKind::Basic);
    }

    #[test]
    fn runtime_txt_marks_python() {
        let dir = site(&["requirements.txt"]);
        fs::write(dir.path().join("runtime.txt"), "python-3.12\n").unwrap();
        let builder = select_builder(dir.path(), &BuildSettings::default()).unwrap();
        assert_eq!(builder.kind(), BuilderKind::Python);
    }

    #[test]
    fn custom_command_wins_over_detection() {
        let dir = site(&["App.sln"]);
        fs::write(
            dir.path().join(DEPLOYMENT_FILE),
            "[config]\ncommand = \"./deploy.sh\"\n",
        )
        .unwrap();
        let builder = select_builder(dir.path(), &BuildSettings::default()).unwrap();
        assert_eq!(builder.kind(), BuilderKind::Custom);

        let settings = BuildSettings {
            command: Some("make".to_owned()),
            ..BuildSettings::default()
        };
        let dir = site(&["index.html"]);
        assert_eq!(
            select_builder(dir.path(), &settings).unwrap().kind(),
            BuilderKind::Custom
        );
    }

    #[test]
    fn project_subdirectory_is_honored() {
        let dir = site(&["README.md", "src/site/index.html"]);
        let settings = BuildSettings {
            project: Some(PathBuf::from("src/site")),
            ..BuildSettings::default()
        };
        let builder = select_builder(dir.path(), &settings).unwrap();
        assert_eq!(builder.kind(), BuilderKind::Static);
    }

    #[test]
    fn missing_project_is_an_error() {
        let dir = site(&["index.html"]);
        let settings = BuildSettings {
            project: Some(PathBuf::from("nope")),
            ..BuildSettings::default()
        };
        assert!(matches!(
            select_builder(dir.path(), &settings),
            Err(BuildError::ProjectNotFound(_))
        ));
    }

    #[test]
    fn two_solutions_are_ambiguous() {
        let dir = site(&["A.sln", "B.sln"]);
        assert!(matches!(
            select_builder(dir.path(), &BuildSettings::default()),
            Err(BuildError::AmbiguousProject { .. })
        ));
    }

    #[test]
    fn malformed_deployment_file_is_rejected() {
        let dir = site(&["index.html"]);
        fs::write(dir.path().join(DEPLOYMENT_FILE), "[config\ncommand=").unwrap();
        assert!(matches!(
            select_builder(dir.path(), &BuildSettings::default()),
            Err(BuildError::InvalidDeploymentFile(_))
        ));
    }
}
