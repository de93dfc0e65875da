//! Agent invocation tables.
//!
//! Each agent kind is a separate executable inside the framework directory,
//! launched through the configured interpreter with CLI-style arguments. The
//! contract with agents is stdio streaming plus well-known files written
//! under the spec directory; nothing richer.

use std::path::{Path, PathBuf};

use autobuild_core::types::AgentKind;

/// A fully resolved command line for one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory: always the framework install itself.
    pub cwd: PathBuf,
}

/// What to run, with per-kind parameters.
#[derive(Debug, Clone)]
pub enum AgentInvocation {
    SpecCreation {
        spec_id: String,
        description: String,
    },
    Implementation {
        spec_id: String,
        parallel_workers: Option<u32>,
        model: Option<String>,
    },
    Qa {
        spec_id: String,
        qa_only: bool,
    },
    Roadmap {
        project_path: String,
        refresh: bool,
    },
    Ideation {
        project_path: String,
        categories: Vec<String>,
        include_context: bool,
        max_ideas_per_category: Option<u32>,
        refresh: bool,
    },
    MergeResolver {
        base_file: String,
        ours_file: String,
        theirs_file: String,
        output_file: String,
    },
}

impl AgentInvocation {
    pub fn kind(&self) -> AgentKind {
        match self {
            Self::SpecCreation { .. } => AgentKind::SpecCreation,
            Self::Implementation { .. } => AgentKind::Implementation,
            Self::Qa { .. } => AgentKind::Qa,
            Self::Roadmap { .. } => AgentKind::Roadmap,
            Self::Ideation { .. } => AgentKind::Ideation,
            Self::MergeResolver { .. } => AgentKind::MergeResolver,
        }
    }

    fn script(&self) -> &'static str {
        match self.kind() {
            AgentKind::SpecCreation => "spec_agent.py",
            AgentKind::Implementation => "coding_agent.py",
            AgentKind::Qa => "qa_agent.py",
            AgentKind::Roadmap => "roadmap_agent.py",
            AgentKind::Ideation => "ideation_agent.py",
            AgentKind::MergeResolver => "merge_agent.py",
        }
    }

    /// Build the command line for this invocation.
    pub fn command(&self, framework_dir: &Path, interpreter: &str) -> AgentCommand {
        let mut args = vec![self.script().to_string()];
        match self {
            Self::SpecCreation {
                spec_id,
                description,
            } => {
                args.push("--spec-id".to_string());
                args.push(spec_id.clone());
                args.push(description.clone());
            }
            Self::Implementation {
                spec_id,
                parallel_workers,
                model,
            } => {
                args.push("--spec".to_string());
                args.push(spec_id.clone());
                if let Some(workers) = parallel_workers {
                    args.push("--parallel".to_string());
                    args.push(workers.to_string());
                }
                if let Some(model) = model {
                    args.push("--model".to_string());
                    args.push(model.clone());
                }
            }
            Self::Qa { spec_id, qa_only } => {
                args.push("--spec".to_string());
                args.push(spec_id.clone());
                if *qa_only {
                    args.push("--qa-only".to_string());
                }
            }
            Self::Roadmap {
                project_path,
                refresh,
            } => {
                args.push("--project".to_string());
                args.push(project_path.clone());
                if *refresh {
                    args.push("--refresh".to_string());
                }
            }
            Self::Ideation {
                project_path,
                categories,
                include_context,
                max_ideas_per_category,
                refresh,
            } => {
                args.push("--project".to_string());
                args.push(project_path.clone());
                // Every enabled category is passed through; unknown ones are
                // the agent's to reject.
                for category in categories {
                    args.push("--category".to_string());
                    args.push(category.clone());
                }
                if *include_context {
                    args.push("--include-context".to_string());
                }
                if let Some(max) = max_ideas_per_category {
                    args.push("--max-ideas-per-category".to_string());
                    args.push(max.to_string());
                }
                if *refresh {
                    args.push("--refresh".to_string());
                }
            }
            Self::MergeResolver {
                base_file,
                ours_file,
                theirs_file,
                output_file,
            } => {
                args.push("--base".to_string());
                args.push(base_file.clone());
                args.push("--ours".to_string());
                args.push(ours_file.clone());
                args.push("--theirs".to_string());
                args.push(theirs_file.clone());
                args.push("--output".to_string());
                args.push(output_file.clone());
            }
        }
        AgentCommand {
            program: PathBuf::from(interpreter),
            args,
            cwd: framework_dir.to_path_buf(),
        }
    }
}

/// Conflict resolution by the merge agent: the three versions go to temp
/// files, the agent writes the resolved content to an output file.
#[derive(Debug, Clone)]
pub struct AgentResolver {
    pub framework_dir: PathBuf,
    pub interpreter: String,
}

impl crate::worktree::ConflictResolver for AgentResolver {
    fn resolve(
        &self,
        path: &str,
        base: Option<&str>,
        ours: &str,
        theirs: &str,
    ) -> std::result::Result<String, String> {
        let dir = tempfile::tempdir().map_err(|e| e.to_string())?;
        let base_file = dir.path().join("base");
        let ours_file = dir.path().join("ours");
        let theirs_file = dir.path().join("theirs");
        let output_file = dir.path().join("resolved");
        std::fs::write(&base_file, base.unwrap_or_default()).map_err(|e| e.to_string())?;
        std::fs::write(&ours_file, ours).map_err(|e| e.to_string())?;
        std::fs::write(&theirs_file, theirs).map_err(|e| e.to_string())?;

        let invocation = AgentInvocation::MergeResolver {
            base_file: base_file.display().to_string(),
            ours_file: ours_file.display().to_string(),
            theirs_file: theirs_file.display().to_string(),
            output_file: output_file.display().to_string(),
        };
        let command = invocation.command(&self.framework_dir, &self.interpreter);

        let output = std::process::Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.cwd)
            .output()
            .map_err(|e| format!("merge agent spawn failed for {path}: {e}"))?;
        if !output.status.success() {
            return Err(format!(
                "merge agent failed for {path}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        std::fs::read_to_string(&output_file)
            .map_err(|e| format!("merge agent wrote no output for {path}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framework() -> PathBuf {
        PathBuf::from("/proj/.auto-build")
    }

    #[test]
    fn spec_creation_carries_description_as_argument() {
        let cmd = AgentInvocation::SpecCreation {
            spec_id: "add-export".to_string(),
            description: "Implement X in module Y".to_string(),
        }
        .command(&framework(), "python3");
        assert_eq!(cmd.program, PathBuf::from("python3"));
        assert_eq!(cmd.cwd, framework());
        assert_eq!(
            cmd.args,
            vec![
                "spec_agent.py",
                "--spec-id",
                "add-export",
                "Implement X in module Y"
            ]
        );
    }

    #[test]
    fn implementation_flags_are_optional() {
        let bare = AgentInvocation::Implementation {
            spec_id: "s1".to_string(),
            parallel_workers: None,
            model: None,
        }
        .command(&framework(), "python3");
        assert_eq!(bare.args, vec!["coding_agent.py", "--spec", "s1"]);

        let full = AgentInvocation::Implementation {
            spec_id: "s1".to_string(),
            parallel_workers: Some(4),
            model: Some("sonnet".to_string()),
        }
        .command(&framework(), "python3");
        assert_eq!(
            full.args,
            vec![
                "coding_agent.py",
                "--spec",
                "s1",
                "--parallel",
                "4",
                "--model",
                "sonnet"
            ]
        );
    }

    #[test]
    fn qa_only_flag_is_passed() {
        let cmd = AgentInvocation::Qa {
            spec_id: "s1".to_string(),
            qa_only: true,
        }
        .command(&framework(), "python3");
        assert_eq!(cmd.args, vec!["qa_agent.py", "--spec", "s1", "--qa-only"]);
    }

    #[test]
    fn ideation_passes_every_enabled_category() {
        let cmd = AgentInvocation::Ideation {
            project_path: "/proj".to_string(),
            categories: vec![
                "low_hanging_fruit".to_string(),
                "ui_ux_improvements".to_string(),
                "high_value_features".to_string(),
                "custom_category".to_string(),
            ],
            include_context: true,
            max_ideas_per_category: Some(5),
            refresh: false,
        }
        .command(&framework(), "python3");
        let joined = cmd.args.join(" ");
        assert_eq!(joined.matches("--category").count(), 4);
        assert!(joined.contains("--category custom_category"));
        assert!(joined.contains("--include-context"));
        assert!(joined.contains("--max-ideas-per-category 5"));
        assert!(!joined.contains("--refresh"));
    }

    #[test]
    fn merge_resolver_names_all_three_inputs() {
        let cmd = AgentInvocation::MergeResolver {
            base_file: "/tmp/base".to_string(),
            ours_file: "/tmp/ours".to_string(),
            theirs_file: "/tmp/theirs".to_string(),
            output_file: "/tmp/out".to_string(),
        }
        .command(&framework(), "python3");
        assert_eq!(
            cmd.args,
            vec![
                "merge_agent.py",
                "--base",
                "/tmp/base",
                "--ours",
                "/tmp/ours",
                "--theirs",
                "/tmp/theirs",
                "--output",
                "/tmp/out"
            ]
        );
    }
}
