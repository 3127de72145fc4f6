use std::sync::Arc;

use crate::commands::{current_thread_runtime, CommandResult};
use serde::Serialize;
use syncso_agent::AgentRuntime;
use syncso_core::config::{AppConfig, LoadOptions};
use syncso_core::memory_store::InMemoryConversationStore;
use syncso_db::{connect, migrations};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str) -> Self {
        Self {
            name,
            status: CheckStatus::Skipped,
            details: "skipped because configuration did not load".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_llm_credentials(&config));
            checks.push(check_database(&config));
            checks.push(check_agent_catalog(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.push(DoctorCheck::skipped("llm_credentials"));
            checks.push(DoctorCheck::skipped("database_connectivity"));
            checks.push(DoctorCheck::skipped("agent_catalog"));
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_llm_credentials(config: &AppConfig) -> DoctorCheck {
    let provider = config.llm.provider;
    let endpoint = config.llm.effective_base_url();
    match (provider.requires_api_key(), config.llm.api_key.is_some()) {
        (true, false) => DoctorCheck::fail(
            "llm_credentials",
            format!("provider `{}` requires SYNCSO_LLM_API_KEY", provider.as_str()),
        ),
        (true, true) => DoctorCheck::pass(
            "llm_credentials",
            format!("provider `{}` at {endpoint} with api key configured", provider.as_str()),
        ),
        (false, _) => DoctorCheck::pass(
            "llm_credentials",
            format!("provider `{}` at {endpoint} needs no api key", provider.as_str()),
        ),
    }
}

fn check_database(config: &AppConfig) -> DoctorCheck {
    let runtime = match current_thread_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck::fail(
                "database_connectivity",
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        let pending = migrations::pending_count(&pool)
            .await
            .map_err(|error| format!("failed to inspect migrations: {error}"))?;

        pool.close().await;
        Ok::<usize, String>(pending)
    });

    match result {
        Ok(0) => DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`; schema is current", config.database.url),
        ),
        Ok(pending) => DoctorCheck::pass(
            "database_connectivity",
            format!(
                "connected using `{}`; {pending} migration(s) pending (run `syncso migrate`)",
                config.database.url
            ),
        ),
        Err(error) => DoctorCheck::fail("database_connectivity", error),
    }
}

fn check_agent_catalog(config: &AppConfig) -> DoctorCheck {
    match AgentRuntime::from_config(config, Arc::new(InMemoryConversationStore::new())) {
        Ok(runtime) => {
            let active = runtime.registry().list_active();
            let ids = active.iter().map(|agent| agent.id.as_str()).collect::<Vec<_>>().join(", ");
            DoctorCheck::pass(
                "agent_catalog",
                format!(
                    "{} agent(s) ready on model `{}` with {} routing: {ids}",
                    active.len(),
                    config.llm.model,
                    runtime.orchestrator().router_name()
                ),
            )
        }
        Err(error) => DoctorCheck::fail("agent_catalog", error.to_string()),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
