//! Status aggregation and the fleet table
//!
//! Rows are collected through the batch executor, sorted by name and then
//! folded into totals. Totals only count rows the ledger reports registered.
//! A failed ledger lookup only blanks the ledger columns of its row.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::batch::{run_parallel, Cancel, NodeOutcome};
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::inventory::Node;
use crate::ledger::RegistrationInfo;
use crate::probe::{NodeStatus, Probe};
use crate::remote::Session;

/// One node's probed state and ledger record
#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub status: NodeStatus,
    pub registration: Option<RegistrationInfo>,
}

impl Inspection {
    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.registration.as_ref().map_or(false, |info| info.active)
    }
}

/// Probe state and ask the ledger about the node's configured identity
pub async fn inspect(fleet: &Fleet, node: &Node, session: &dyn Session) -> Result<Inspection> {
    let status = fleet.prober().probe(session).await;
    let registration = lookup(fleet, node).await?;
    debug!(node = %node.name, registered = registration.is_some(), "Node inspected");
    Ok(Inspection {
        status,
        registration,
    })
}

async fn lookup(fleet: &Fleet, node: &Node) -> Result<Option<RegistrationInfo>> {
    let address = fleet.identity_for(node).address()?;
    Ok(fleet.ledger.lookup(&address).await?)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportRow {
    pub node: Node,
    /// `None` when probing the node failed outright
    pub status: Option<NodeStatus>,
    /// `Known(None)` for an identity the ledger does not know
    pub registration: Probe<Option<RegistrationInfo>>,
}

impl ReportRow {
    fn info(&self) -> Option<&RegistrationInfo> {
        self.registration.known().and_then(Option::as_ref)
    }
}

/// Sums over registered rows
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Totals {
    pub registered: usize,
    pub stake: f64,
    pub rank: f64,
    pub trust: f64,
    pub consensus: f64,
    pub incentive: f64,
    pub dividends: f64,
    pub emission: f64,
}

impl Totals {
    fn add(mut self, info: &RegistrationInfo) -> Self {
        self.registered += 1;
        self.stake += info.stake;
        self.rank += info.rank;
        self.trust += info.trust;
        self.consensus += info.consensus;
        self.incentive += info.incentive;
        self.dividends += info.dividends;
        self.emission += info.emission;
        self
    }

    fn metrics(&self) -> [f64; 7] {
        [
            self.stake,
            self.rank,
            self.trust,
            self.consensus,
            self.incentive,
            self.dividends,
            self.emission,
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetReport {
    pub rows: Vec<ReportRow>,
    pub totals: Totals,
}

const HEADERS: [&str; 22] = [
    "Name",
    "Tag",
    "IP",
    "Location",
    "Size",
    "Connected",
    "Branch",
    "Installed",
    "Registered",
    "Running",
    "Uid",
    "Stake",
    "Rank",
    "Trust",
    "Consensus",
    "Incentive",
    "Dividends",
    "Emission",
    "LastUpdate",
    "Active",
    "Coldkey",
    "Hotkey",
];

/// Index of the first summable metric column (Stake)
const METRICS_START: usize = 11;
const UNKNOWN: &str = "?";
const PLACEHOLDER: &str = "-";

fn flag(probe: &Probe<bool>) -> String {
    match probe {
        Probe::Known(value) => value.to_string(),
        Probe::Unknown => UNKNOWN.to_string(),
    }
}

fn metric(value: f64) -> String {
    format!("{:.5}", value)
}

impl ReportRow {
    fn cells(&self) -> Vec<String> {
        let node = &self.node;
        let Some(status) = &self.status else {
            let mut cells = vec![PLACEHOLDER.to_string(); HEADERS.len()];
            cells[0] = node.name.clone();
            return cells;
        };

        let mut cells = vec![
            node.name.clone(),
            node.tags.join(","),
            node.address.clone(),
            node.region.clone().unwrap_or_else(|| PLACEHOLDER.into()),
            node.size.clone().unwrap_or_else(|| PLACEHOLDER.into()),
            status.connectivity.to_string(),
            match &status.branch {
                Probe::Known(Some(branch)) => branch.clone(),
                Probe::Known(None) => "none".into(),
                Probe::Unknown => UNKNOWN.into(),
            },
            flag(&status.installed),
            match &self.registration {
                Probe::Known(info) => info.is_some().to_string(),
                Probe::Unknown => UNKNOWN.into(),
            },
            flag(&status.running),
        ];

        match &self.registration {
            Probe::Known(Some(info)) => {
                cells.push(info.uid.to_string());
                cells.extend(info.metrics().into_iter().map(metric));
                cells.push(info.last_update.to_string());
                cells.push(info.active.to_string());
            }
            Probe::Known(None) => cells.extend(std::iter::repeat(PLACEHOLDER.to_string()).take(10)),
            Probe::Unknown => cells.extend(std::iter::repeat(UNKNOWN.to_string()).take(10)),
        }

        let files = status.identity_files.known();
        let coldkey = files.and_then(|f| f.custodial_key.as_deref());
        let hotkey = files.and_then(|f| f.operational_key.as_deref());
        cells.push(
            coldkey
                .map(|key| key.chars().take(10).collect::<String>())
                .unwrap_or_else(|| PLACEHOLDER.into()),
        );
        cells.push(hotkey.unwrap_or(PLACEHOLDER).to_string());
        cells
    }
}

impl FleetReport {
    /// Sort rows by name and total the registered ones
    pub fn from_rows(mut rows: Vec<ReportRow>) -> Self {
        rows.sort_by(|a, b| a.node.name.cmp(&b.node.name));
        let totals = rows
            .iter()
            .filter_map(ReportRow::info)
            .fold(Totals::default(), Totals::add);
        Self { rows, totals }
    }

    /// Aligned text table with a totals footer
    pub fn render(&self) -> String {
        let mut table: Vec<Vec<String>> = vec![HEADERS.iter().map(|h| h.to_string()).collect()];
        table.extend(self.rows.iter().map(ReportRow::cells));

        let mut footer = vec![String::new(); HEADERS.len()];
        footer[0] = format!("Total ({}/{})", self.totals.registered, self.rows.len());
        for (i, value) in self.totals.metrics().into_iter().enumerate() {
            footer[METRICS_START + i] = metric(value);
        }
        table.push(footer);

        let widths: Vec<usize> = (0..HEADERS.len())
            .map(|col| table.iter().map(|row| row[col].chars().count()).max().unwrap_or(0))
            .collect();

        let mut out = String::new();
        let last = table.len() - 1;
        for (i, row) in table.iter().enumerate() {
            if i == last {
                out.push_str(&separator(&widths));
            }
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = width))
                .collect::<Vec<_>>()
                .join("  ");
            out.push_str(line.trim_end());
            out.push('\n');
            if i == 0 {
                out.push_str(&separator(&widths));
            }
        }
        out
    }
}

fn separator(widths: &[usize]) -> String {
    let total = widths.iter().sum::<usize>() + 2 * widths.len().saturating_sub(1);
    format!("{}\n", "-".repeat(total))
}

/// Probe every node concurrently and build the report
pub async fn build_report(fleet: &Arc<Fleet>, nodes: Vec<Node>, cancel: &Cancel) -> FleetReport {
    let workers = fleet.config.max_threads;
    let shared = fleet.clone();

    let batch = run_parallel(nodes, workers, cancel, move |node: Node| {
        let fleet = shared.clone();
        async move {
            let session = fleet.transport.open(&node).await?;
            let status = fleet.prober().probe(session.as_ref()).await;
            session.close().await;

            let registration = match lookup(&fleet, &node).await {
                Ok(registration) => Probe::Known(registration),
                Err(e) => {
                    warn!(node = %node.name, error = %e, "Ledger lookup failed");
                    Probe::Unknown
                }
            };
            Ok::<_, FleetError>((status, registration))
        }
    })
    .await;

    let rows = batch
        .results
        .into_iter()
        .map(|result| match result.outcome {
            NodeOutcome::Succeeded((status, registration)) => ReportRow {
                node: result.node,
                status: Some(status),
                registration,
            },
            NodeOutcome::Failed(_) | NodeOutcome::Skipped => ReportRow {
                node: result.node,
                status: None,
                registration: Probe::Unknown,
            },
        })
        .collect();

    FleetReport::from_rows(rows)
}
