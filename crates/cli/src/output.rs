use anyhow::Result;
use cqlop_controller::scheduler::ConvergeReport;
use cqlop_core::{AnyManaged, ConditionType};
use cqlop_db::ClusterState;
use cqlop_persist::{now_ts, HistoryEntry};
use serde::Serialize;

use crate::Output;

#[derive(Serialize)]
struct ResultRow<'a> {
    kind: &'a str,
    name: &'a str,
    outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn condition(obj: &AnyManaged, kind: ConditionType) -> &'static str {
    match obj.resource_status().condition(kind).map(|c| c.status) {
        Some(cqlop_core::ConditionStatus::True) => "True",
        Some(cqlop_core::ConditionStatus::False) => "False",
        _ => "Unknown",
    }
}

pub fn print_converge(out: Output, report: &ConvergeReport, statements: &[String]) -> Result<()> {
    let mut rows: Vec<ResultRow> = report
        .gone
        .iter()
        .map(|o| ResultRow { kind: o.kind().as_str(), name: o.name(), outcome: "gone".into(), error: None })
        .collect();
    rows.extend(report.last.results.iter().filter(|r| !r.is_gone()).map(|r| ResultRow {
        kind: r.object.kind().as_str(),
        name: r.object.name(),
        outcome: match &r.result {
            Ok(rep) => rep.outcome.to_string(),
            Err(_) => "error".into(),
        },
        error: r.result.as_ref().err().map(|e| e.to_string()),
    }));
    match out {
        Output::Human => {
            println!("{:<9} {:<24} {}", "KIND", "NAME", "OUTCOME");
            for r in &rows {
                match &r.error {
                    Some(e) => println!("{:<9} {:<24} error: {}", r.kind, r.name, e),
                    None => println!("{:<9} {:<24} {}", r.kind, r.name, r.outcome),
                }
            }
            for s in statements {
                println!("  > {}", s);
            }
            let state = if report.converged { "converged" } else { "not converged" };
            println!("{} after {} pass(es)", state, report.passes);
        }
        Output::Json => {
            #[derive(Serialize)]
            struct Doc<'a> {
                passes: usize,
                converged: bool,
                results: Vec<ResultRow<'a>>,
                statements: &'a [String],
            }
            let doc = Doc { passes: report.passes, converged: report.converged, results: rows, statements };
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

pub fn print_objects(out: Output, objects: &[AnyManaged]) -> Result<()> {
    match out {
        Output::Human => {
            println!("{:<9} {:<24} {:<24} {:<8} {}", "KIND", "NAME", "EXTERNAL-NAME", "READY", "SYNCED");
            for o in objects {
                println!(
                    "{:<9} {:<24} {:<24} {:<8} {}",
                    o.kind().as_str(),
                    o.name(),
                    o.external_name().unwrap_or("-"),
                    condition(o, ConditionType::Ready),
                    condition(o, ConditionType::Synced)
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(objects)?),
    }
    Ok(())
}

pub fn print_history(out: Output, entries: &[HistoryEntry]) -> Result<()> {
    match out {
        Output::Human => {
            println!("{:<8} {:<12} {}", "AGE", "OUTCOME", "MESSAGE");
            for e in entries {
                println!("{:<8} {:<12} {}", render_age(e.ts), e.outcome, e.message.as_deref().unwrap_or(""));
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(entries)?),
    }
    Ok(())
}

pub fn print_cluster(out: Output, state: &ClusterState) -> Result<()> {
    match out {
        Output::Human => {
            println!("keyspaces:");
            for (name, ks) in &state.keyspaces {
                let opts: Vec<String> = ks.replication.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                println!("  {:<24} {} durable_writes={}", name, opts.join(","), ks.durable_writes);
            }
            println!("roles:");
            for (name, r) in &state.roles {
                println!("  {:<24} superuser={} login={}", name, r.is_superuser, r.can_login);
            }
            println!("permissions:");
            for (role, by_resource) in &state.permissions {
                for (resource, perms) in by_resource {
                    let perms: Vec<&str> = perms.iter().map(String::as_str).collect();
                    println!("  {:<24} {:<24} {}", role, resource, perms.join(","));
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(state)?),
    }
    Ok(())
}

fn render_age(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    let mut secs = (now_ts() - ts).max(0) as u64;
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
