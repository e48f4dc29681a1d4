//! Command execution layer: wires CLI invocations to the ledger core.
//!
//! Each function maps a CLI command to core operations, shapes the output
//! (human or `--json`), and picks the exit code. The core itself never
//! prints.

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::Command;

use crate::agent_identity::resolve_agent_id;
use crate::cli::SyncArgs;
use crate::config::EluentConfig;
use crate::errors;
use crate::output::{json_error, json_success, ExitCode, OutputContext};
use crate::sync::{
    GitGateway, GlobalPaths, LedgerError, LedgerSettings, LedgerSyncer, ReconcileStatus,
};

/// Everything a command needs: repository, configuration, and output mode.
pub struct CommandContext {
    pub repo_root: PathBuf,
    pub config: EluentConfig,
    pub out: OutputContext,
}

impl CommandContext {
    pub fn detect(quiet: bool, json: bool) -> Result<Self> {
        let repo_root = detect_repo_root()?;
        let config = EluentConfig::load(&repo_root)?;
        Ok(Self {
            repo_root,
            config,
            out: OutputContext::new(quiet, json),
        })
    }

    fn build_syncer(&self) -> Result<LedgerSyncer, LedgerError> {
        self.build_syncer_with(|settings| settings)
    }

    fn build_syncer_with(
        &self,
        adjust: impl FnOnce(LedgerSettings) -> LedgerSettings,
    ) -> Result<LedgerSyncer, LedgerError> {
        let settings = self
            .config
            .ledger_settings()
            .ok_or(LedgerError::NotConfigured)?;
        let settings = adjust(settings);

        let repo_name = self
            .repo_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let paths = GlobalPaths::new(&repo_name, self.config.global_path_override())?;
        let gateway = GitGateway::new(&self.repo_root).map_err(LedgerError::from)?;
        LedgerSyncer::new(gateway, paths, settings)
    }
}

/// Locate the primary working tree of the enclosing repository.
pub fn detect_repo_root() -> Result<PathBuf> {
    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output()
        .context("Failed to execute git")?;

    if !output.status.success() {
        anyhow::bail!(
            "Not in a git repository\n\n\
             Eluent coordinates through git; run inside a repository clone."
        );
    }

    Ok(PathBuf::from(
        String::from_utf8(output.stdout)
            .context("git returned a non-UTF-8 path")?
            .trim(),
    ))
}

/// Dispatch `eluent sync` to the selected mode.
pub fn run_sync(ctx: &CommandContext, args: &SyncArgs) -> ExitCode {
    if args.setup_ledger {
        sync_setup(ctx)
    } else if args.ledger_only {
        sync_ledger_only(ctx)
    } else if args.reconcile {
        sync_reconcile(ctx)
    } else if args.status {
        sync_status(ctx)
    } else if args.force_resync {
        sync_force_resync(ctx, args.yes)
    } else {
        sync_cleanup(ctx, args.yes)
    }
}

fn sync_setup(ctx: &CommandContext) -> ExitCode {
    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    let result = syncer.setup();
    match result.error {
        None => {
            ctx.out.print_json(&json_success(serde_json::json!({
                "created_branch": result.created_branch,
                "created_worktree": result.created_worktree,
            })));
            if result.created_branch {
                ctx.out.print_info(format!(
                    "Created ledger branch '{}'",
                    syncer.settings().branch
                ));
            }
            if result.created_worktree {
                ctx.out.print_info(format!(
                    "Created ledger worktree at {}",
                    syncer.paths().worktree_dir().display()
                ));
            }
            ctx.out.print_data("Ledger sync is ready");
            ExitCode::Success
        }
        Some(e) => fail(ctx, &e),
    }
}

fn sync_ledger_only(ctx: &CommandContext) -> ExitCode {
    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    let pulled = syncer.pull_ledger();
    if let Some(e) = pulled.error {
        return fail(ctx, &e);
    }
    let pushed = syncer.push_ledger();
    if let Some(e) = pushed.error {
        return fail(ctx, &e);
    }
    let mirrored = syncer.sync_to_main();
    if let Some(e) = mirrored.error {
        return fail(ctx, &e);
    }

    ctx.out.print_json(&json_success(serde_json::json!({
        "pulled": pulled.changes_applied,
        "pushed": pushed.changes_applied,
        "mirrored": mirrored.changes_applied,
    })));
    ctx.out.print_data(format!(
        "Ledger synchronized ({} pulled, {} pushed)",
        pulled.changes_applied, pushed.changes_applied
    ));
    ExitCode::Success
}

fn sync_reconcile(ctx: &CommandContext) -> ExitCode {
    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    let reports = syncer.reconcile_offline_claims();
    if reports.is_empty() {
        ctx.out
            .print_json(&json_success(serde_json::json!({ "reports": [] })));
        ctx.out.print_data("No offline claims to reconcile");
        return ExitCode::Success;
    }

    let mut had_errors = false;
    let mut json_reports = Vec::with_capacity(reports.len());
    for report in &reports {
        let (label, owner) = match &report.status {
            ReconcileStatus::Reconciled => ("reconciled".to_string(), None),
            ReconcileStatus::Conflict { owner } => {
                (format!("conflict (owned by {owner})"), Some(owner.clone()))
            }
            ReconcileStatus::AtomMissing => ("atom missing".to_string(), None),
            ReconcileStatus::Error(e) => {
                had_errors = true;
                (format!("error: {e}"), None)
            }
        };
        ctx.out
            .print_data(format!("{}: {}", report.atom_id, label));
        json_reports.push(serde_json::json!({
            "atom_id": report.atom_id,
            "agent_id": report.agent_id,
            "status": label,
            "owner": owner,
        }));
    }
    ctx.out
        .print_json(&json_success(serde_json::json!({ "reports": json_reports })));

    if had_errors {
        ExitCode::Failure
    } else {
        ExitCode::Success
    }
}

fn sync_status(ctx: &CommandContext) -> ExitCode {
    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    let state = match syncer.state_store().load() {
        Ok(state) => state,
        Err(e) => return fail(ctx, &e),
    };
    let healthy = syncer.is_healthy();

    ctx.out.print_json(&json_success(serde_json::json!({
        "branch": syncer.settings().branch,
        "healthy": healthy,
        "worktree": syncer.paths().worktree_dir().display().to_string(),
        "ledger_head": state.ledger_head,
        "last_pull_at": state.last_pull_at.map(|t| t.to_rfc3339()),
        "last_push_at": state.last_push_at.map(|t| t.to_rfc3339()),
        "offline_claims": state.offline_claims.len(),
    })));

    ctx.out
        .print_data(format!("Ledger branch:   {}", syncer.settings().branch));
    ctx.out.print_data(format!(
        "Health:          {}",
        if healthy { "ok" } else { "unhealthy" }
    ));
    ctx.out.print_data(format!(
        "Worktree:        {}",
        syncer.paths().worktree_dir().display()
    ));
    ctx.out.print_data(format!(
        "Ledger head:     {}",
        state.ledger_head.as_deref().unwrap_or("-")
    ));
    ctx.out.print_data(format!(
        "Last pull:       {}",
        state
            .last_pull_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    ));
    ctx.out.print_data(format!(
        "Last push:       {}",
        state
            .last_push_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    ));
    ctx.out.print_data(format!(
        "Offline claims:  {}",
        state.offline_claims.len()
    ));

    if !healthy {
        ctx.out.print_warning(
            "ledger is unhealthy; try `eluent sync --setup-ledger` or `--force-resync`",
        );
    }

    if healthy {
        ExitCode::Success
    } else {
        ExitCode::Failure
    }
}

fn sync_force_resync(ctx: &CommandContext, yes: bool) -> ExitCode {
    if !confirm(
        ctx,
        yes,
        "Rebuild the ledger from the remote? Local sync state will be deleted.",
    ) {
        ctx.out.print_data("Aborted");
        return ExitCode::Failure;
    }

    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    let torn_down = syncer.teardown();
    if let Some(e) = torn_down.error {
        return fail(ctx, &e);
    }
    let setup = syncer.setup();
    if let Some(e) = setup.error {
        return fail(ctx, &e);
    }
    let pulled = syncer.pull_ledger();
    if let Some(e) = pulled.error {
        return fail(ctx, &e);
    }

    ctx.out.print_json(&json_success(serde_json::json!({
        "pulled": pulled.changes_applied,
    })));
    ctx.out.print_data("Ledger rebuilt from the remote");
    ExitCode::Success
}

fn sync_cleanup(ctx: &CommandContext, yes: bool) -> ExitCode {
    if !confirm(
        ctx,
        yes,
        "Remove the ledger worktree and all sync state for this repository?",
    ) {
        ctx.out.print_data("Aborted");
        return ExitCode::Failure;
    }

    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    match syncer.teardown().error {
        None => {
            ctx.out
                .print_json(&json_success(serde_json::json!({ "removed": true })));
            ctx.out.print_data("Ledger worktree and sync state removed");
            ExitCode::Success
        }
        Some(e) => fail(ctx, &e),
    }
}

/// `eluent claim <atom_id>`.
pub fn run_claim(
    ctx: &CommandContext,
    atom_id: &str,
    agent_flag: Option<&str>,
    offline: bool,
    force: bool,
) -> ExitCode {
    let agent_id = match resolve_agent_id(agent_flag) {
        Ok(id) => id,
        Err(e) => {
            ctx.out.print_error(format!("Error: {e:#}"));
            return ExitCode::Failure;
        }
    };

    let syncer = match ctx.build_syncer_with(|mut settings| {
        if offline {
            settings.auto_claim_push = false;
        }
        settings
    }) {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    let result = syncer.claim_with_options(atom_id, &agent_id, force);
    if result.success {
        ctx.out.print_json(&json_success(serde_json::json!({
            "atom_id": atom_id,
            "claimed_by": result.claimed_by,
            "retries": result.retries,
            "offline_claim": result.offline_claim,
        })));

        if result.offline_claim {
            ctx.out.print_warning(
                "claim recorded locally only; run `eluent sync --reconcile` once the remote is reachable",
            );
        } else {
            let mirrored = syncer.sync_to_main();
            if let Some(e) = mirrored.error {
                ctx.out
                    .print_warning(format!("claimed, but mirroring to the working tree failed: {e}"));
            }
        }

        ctx.out
            .print_data(format!("Claimed {atom_id} as {agent_id}"));
        return ExitCode::Success;
    }

    let error = result
        .error
        .unwrap_or_else(|| LedgerError::Internal("claim failed without an error".to_string()));
    fail(ctx, &error)
}

/// `eluent release <atom_id>`.
pub fn run_release(ctx: &CommandContext, atom_id: &str) -> ExitCode {
    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    match syncer.release_claim(atom_id).error {
        None => {
            ctx.out.print_json(&json_success(
                serde_json::json!({ "atom_id": atom_id, "released": true }),
            ));
            let mirrored = syncer.sync_to_main();
            if let Some(e) = mirrored.error {
                ctx.out
                    .print_warning(format!("released, but mirroring to the working tree failed: {e}"));
            }
            ctx.out.print_data(format!("Released {atom_id}"));
            ExitCode::Success
        }
        Some(e) => fail(ctx, &e),
    }
}

/// `eluent heartbeat <atom_id>`.
pub fn run_heartbeat(ctx: &CommandContext, atom_id: &str, agent_flag: Option<&str>) -> ExitCode {
    let agent_id = match resolve_agent_id(agent_flag) {
        Ok(id) => id,
        Err(e) => {
            ctx.out.print_error(format!("Error: {e:#}"));
            return ExitCode::Failure;
        }
    };

    let syncer = match ctx.build_syncer() {
        Ok(syncer) => syncer,
        Err(e) => return fail(ctx, &e),
    };

    match syncer.heartbeat(atom_id, &agent_id).error {
        None => {
            ctx.out.print_json(&json_success(
                serde_json::json!({ "atom_id": atom_id, "agent_id": agent_id }),
            ));
            ctx.out.print_data(format!("Heartbeat recorded for {atom_id}"));
            ExitCode::Success
        }
        Some(e) => fail(ctx, &e),
    }
}

/// Shared failure path: JSON envelope, diagnosis with hints, exit code.
fn fail(ctx: &CommandContext, error: &LedgerError) -> ExitCode {
    ctx.out.print_json(&json_error(error));
    if !ctx.out.is_json() {
        ctx.out.print_error(errors::diagnose(error));
    }
    ExitCode::for_error(error)
}

/// Destructive modes ask first unless `--yes` was given.
fn confirm(ctx: &CommandContext, yes: bool, prompt: &str) -> bool {
    if yes {
        return true;
    }
    // JSON mode is non-interactive; destructive modes need --yes there
    if ctx.out.is_json() {
        return false;
    }

    eprint!("{prompt} [y/N] ");
    let _ = io::stderr().flush();
    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}
