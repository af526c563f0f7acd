// Startup workflow definitions
//
// Lets the in-memory dev mode (and fresh databases) start with workflows
// without an administration surface.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tripwire_engine::model::NewWorkflow;
use tripwire_engine::{AutomationEngine, AutomationStore};

/// Parse a JSON array of workflow definitions
pub fn parse_workflows(raw: &str) -> Result<Vec<NewWorkflow>> {
    serde_json::from_str(raw).context("Failed to parse workflow definitions")
}

/// Create the workflows in `path` whose names do not exist yet
///
/// Returns the number of workflows created.
pub async fn load_workflows<S: AutomationStore>(
    engine: &AutomationEngine<S>,
    path: &Path,
) -> Result<usize> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let definitions = parse_workflows(&raw)?;

    let existing: HashSet<String> = engine
        .store()
        .list_workflows()
        .await
        .context("Failed to list workflows")?
        .into_iter()
        .map(|w| w.name)
        .collect();

    let mut created = 0;
    for definition in definitions {
        if existing.contains(&definition.name) {
            continue;
        }
        let name = definition.name.clone();
        engine
            .create_workflow(definition)
            .await
            .with_context(|| format!("Invalid workflow {name:?}"))?;
        created += 1;
    }

    info!(path = %path.display(), created, "loaded workflow definitions");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tripwire_engine::InMemoryStore;

    const DEFINITIONS: &str = r#"[
        {
            "name": "course views",
            "event_name": "course_viewed",
            "enabled": true,
            "steps": [
                {
                    "kind": "action",
                    "step_type": "log_dump",
                    "name": "Log",
                    "config": {"template": "course {courseid} viewed"}
                }
            ]
        }
    ]"#;

    #[test]
    fn test_parse_workflows() {
        let workflows = parse_workflows(DEFINITIONS).unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].steps[0].step_type, "log_dump");
        assert!(parse_workflows("{}").is_err());
    }

    #[tokio::test]
    async fn test_load_skips_existing_names() {
        let path = std::env::temp_dir().join(format!(
            "tripwire-workflows-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, DEFINITIONS).unwrap();

        let engine = AutomationEngine::new(InMemoryStore::new());
        assert_eq!(load_workflows(&engine, &path).await.unwrap(), 1);
        assert_eq!(load_workflows(&engine, &path).await.unwrap(), 0);

        std::fs::remove_file(&path).unwrap();
    }
}
