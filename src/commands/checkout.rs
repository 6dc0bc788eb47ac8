//! Reinstall the managed software from its repository at the configured ref

use std::sync::Arc;
use tracing::info;

use crate::batch::{run_parallel, Cancel};
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::remote::{shell_path, shell_quote, RunOptions, Session};

/// `git checkout` arguments for a ref; tags get a local branch
pub fn checkout_target(reference: &str) -> String {
    match reference.strip_prefix("tags/") {
        Some(tag) => format!("{} -b tag-{}", reference, tag),
        None => reference.to_string(),
    }
}

/// Clone fresh and check out `reference`, returning the branch now checked out
pub async fn checkout_node(fleet: &Fleet, session: &dyn Session, reference: &str) -> Result<String> {
    let software = &fleet.config.software;
    let install_dir = software.install_dir.trim_end_matches('/');
    let node = &session.node().name;

    if let Some((parent, _)) = install_dir.rsplit_once('/') {
        if !parent.is_empty() {
            session
                .run(&format!("mkdir -p {}", shell_path(parent)), RunOptions::default())
                .await?;
        }
    }
    session
        .run(&format!("rm -rf {}", shell_path(install_dir)), RunOptions::default())
        .await?;
    session
        .run(
            &format!(
                "git clone --recurse-submodules {} {}",
                shell_quote(&software.repo_url),
                shell_path(install_dir)
            ),
            RunOptions::default(),
        )
        .await?;
    info!(node = %node, repo = %software.repo_url, "Repository cloned");

    session
        .run(
            &format!(
                "cd {} && git checkout {}",
                shell_path(install_dir),
                checkout_target(reference)
            ),
            RunOptions::default(),
        )
        .await?;

    let branch = fleet
        .prober()
        .installed_branch(session)
        .await?
        .ok_or_else(|| FleetError::RemoteCommand {
            node: node.clone(),
            command: "git branch --show-current".into(),
            status: 0,
            stderr: "no branch checked out".into(),
        })?;
    info!(node = %node, branch = %branch, "Checked out");
    Ok(branch)
}

pub async fn checkout(fleet: &Arc<Fleet>, cancel: &Cancel) -> Result<String> {
    let nodes = fleet.nodes().await?;
    let workers = fleet.config.max_threads;
    let shared = fleet.clone();

    let report = run_parallel(nodes, workers, cancel, move |node| {
        let fleet = shared.clone();
        async move {
            let reference = fleet
                .config
                .machines
                .get(&node.name)
                .map(|m| m.branch.clone())
                .unwrap_or_else(|| "master".to_string());

            let session = fleet.transport.open(&node).await?;
            let result = checkout_node(&fleet, session.as_ref(), &reference).await;
            session.close().await;
            result
        }
    })
    .await;

    Ok(report.render(|branch| format!("branch {}", branch)))
}
