// ABOUTME: Pre-flight checks run by the validate command
// ABOUTME: Confirms the source query, destination table, mapped columns, and key index

use crate::sync::{resolve_layout, DestinationStore, SourceStore, SyncPlan, KEY_COLUMN};

/// Individual check result
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Complete pre-flight results
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub connections: Vec<CheckResult>,
    pub source: Vec<CheckResult>,
    pub destination: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn all_checks(&self) -> impl Iterator<Item = &CheckResult> {
        self.connections
            .iter()
            .chain(&self.source)
            .chain(&self.destination)
    }

    pub fn all_passed(&self) -> bool {
        self.all_checks().all(|c| c.passed)
    }

    pub fn failed_count(&self) -> usize {
        self.all_checks().filter(|c| !c.passed).count()
    }

    /// Print formatted output
    pub fn print(&self) {
        println!();
        println!("Pre-flight Checks");
        println!("{}", "═".repeat(61));
        println!();

        for (title, checks) in [
            ("Connections:", &self.connections),
            ("Source:", &self.source),
            ("Destination:", &self.destination),
        ] {
            if checks.is_empty() {
                continue;
            }
            println!("{}", title);
            for check in checks {
                let icon = if check.passed { "✓" } else { "✗" };
                println!("  {} {}", icon, check.message);
                if let Some(ref details) = check.details {
                    println!("      {}", details);
                }
            }
            println!();
        }

        println!("{}", "═".repeat(61));
        if self.all_passed() {
            println!("PASSED: Ready to sync");
        } else {
            println!("FAILED: {} check(s) failed", self.failed_count());
        }
    }
}

/// Check that `plan`'s source query is valid and produces the mapped columns.
pub async fn check_source<S: SourceStore>(plan: &SyncPlan, source: &mut S) -> Vec<CheckResult> {
    let columns = match source.describe(&plan.source_query).await {
        Ok(columns) => columns,
        Err(e) => {
            return vec![CheckResult::fail("source_query", "Source query is invalid")
                .with_details(format!("{:#}", e))]
        }
    };

    let mut checks = vec![CheckResult::pass(
        "source_query",
        format!("Source query is valid ({} columns)", columns.len()),
    )];

    let key_source = plan.mapping.key_source();
    if columns.iter().any(|c| c == key_source) {
        checks.push(CheckResult::pass(
            "source_key",
            format!("Source query returns key column '{}'", key_source),
        ));
    } else {
        checks.push(
            CheckResult::fail(
                "source_key",
                format!("Source query does not return key column '{}'", key_source),
            )
            .with_details("Every record needs a reference id; map it with [[columns]] if it has another name"),
        );
    }

    let absent: Vec<&str> = plan
        .mapping
        .columns()
        .iter()
        .map(|c| c.source_name())
        .filter(|name| *name != key_source && !columns.iter().any(|c| c == name))
        .collect();
    if !absent.is_empty() {
        checks.push(
            CheckResult::pass(
                "source_columns",
                format!("{} mapped column(s) not returned by the source query", absent.len()),
            )
            .with_details(format!("Written as NULL: {}", absent.join(", "))),
        );
    }

    checks
}

/// Check that the destination table has every mapped column and a unique key.
pub async fn check_destination<D: DestinationStore>(
    plan: &SyncPlan,
    destination: &mut D,
) -> Vec<CheckResult> {
    let layout = match resolve_layout(plan, destination).await {
        Ok(layout) => layout,
        Err(e) => {
            return vec![CheckResult::fail("destination_table", "Destination table is not usable")
                .with_details(e.to_string())]
        }
    };

    let mut checks = vec![CheckResult::pass(
        "destination_table",
        format!(
            "Table {} has all {} mapped columns",
            plan.table,
            plan.mapping.columns().len()
        ),
    )];

    let key = KEY_COLUMN;
    match destination.key_is_unique(&layout, key).await {
        Ok(true) => checks.push(CheckResult::pass(
            "key_index",
            format!("Unique index on {}", key),
        )),
        Ok(false) => checks.push(
            CheckResult::fail("key_index", format!("No unique index on {}", key))
                .with_details(format!(
                    "Concurrent inserts cannot be detected. Create one with: CREATE UNIQUE INDEX ON {} ({})",
                    layout.table.quoted(),
                    key
                )),
        ),
        Err(e) => checks.push(
            CheckResult::fail("key_index", "Could not inspect destination indexes")
                .with_details(format!("{:#}", e)),
        ),
    }

    checks
}
