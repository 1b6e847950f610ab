//! Tests for the command handlers and the simulation.

#[cfg(test)]
mod tests {
    use crate::handlers::{load, render_tree, validate};
    use crate::simulate::{self, SimulatedBuild};
    use cruise_core::IntegrationStatus;
    use std::sync::Arc;
    use std::time::Duration;

    const STRUCTURE: &str = r#"
server: local
items:
  - type: project
    name: a
  - type: project
    name: b
  - type: project
    name: c
  - type: queue
    name: shared
    children: [a, b]
  - type: gate
    name: checks
    policy: success
    children: [c]
"#;

    fn write_structure(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cruise.yaml");
        std::fs::write(&path, contents).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_validate_accepts_structure() {
        let (_dir, path) = write_structure(STRUCTURE);
        validate(&path).unwrap();
    }

    #[test]
    fn test_validate_reports_unknown_child() {
        let (_dir, path) = write_structure(
            "items:\n  - type: queue\n    name: q\n    children: [ghost]\n",
        );
        let err = validate(&path).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load("/nonexistent/cruise.yaml").is_err());
    }

    #[test]
    fn test_render_tree() {
        let (_dir, path) = write_structure(STRUCTURE);
        let (_, server) = load(&path).unwrap();

        let rendered = render_tree(&server.status());
        let expected = "\
├── shared [Queue] active=0 pending=0
│   ├── a [Project]
│   └── b [Project]
└── checks [Gate] active=0 pending=0
    └── c [Project]
";
        assert_eq!(rendered, expected);
    }

    #[tokio::test]
    async fn test_simulation_admission_order() {
        let (_dir, path) = write_structure(STRUCTURE);
        let (_, server) = load(&path).unwrap();
        let executor = Arc::new(SimulatedBuild::new(
            Duration::from_millis(5),
            vec!["b".to_string()],
        ));

        let requests: Vec<String> = ["a", "b", "a"].iter().map(|s| s.to_string()).collect();
        let report = simulate::run(Arc::new(server), &requests, executor, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(report.admission_order, vec!["a", "b", "a"]);
        assert_eq!(report.outcomes[1].status, Some(IntegrationStatus::Failure));
        assert_eq!(report.outcomes[2].status, Some(IntegrationStatus::Success));
    }

    #[tokio::test]
    async fn test_simulation_rejects_unknown_project() {
        let (_dir, path) = write_structure(STRUCTURE);
        let (_, server) = load(&path).unwrap();
        let executor = Arc::new(SimulatedBuild::new(Duration::ZERO, Vec::new()));

        let result = simulate::run(
            Arc::new(server),
            &["nope".to_string()],
            executor,
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_err());
    }
}
