/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Runs a scenario through the flow pipeline against simulated switches and prints the flows
//! that result.
//!
//! A scenario is a JSON object:
//!
//! ```json
//! {
//!     "switches": [{"id": 1, "version": "OFP13"}, {"id": 2}],
//!     "flows": [{"tenant": "vtn1", "match_key": "in_port=1", "entries": [...]}],
//!     "steps": [{"Node": {"NodeRemoved": {"switch": 2}}}]
//! }
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

use vflow::sim::Fabric;
use vflow::store::MemStore;
use vflow::{
    Cookie, DataFlow, FlowConfig, FlowDescription, FlowEntry, FlowFilter, FlowId, FlowManager, NodeEvent,
    RemovalSelector, SwitchId, TableMissState, Version,
};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Scenario to run, as JSON.
    scenario: PathBuf,

    /// Pipeline configuration, as JSON.  Every setting has a default.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "vflow=trace".  Overrides RUST_LOG.
    #[clap(long)]
    log: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct Scenario {
    #[serde(default)]
    switches: Vec<ScenarioSwitch>,
    #[serde(default)]
    flows: Vec<FlowDescription>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Deserialize, Debug)]
struct ScenarioSwitch {
    id: SwitchId,
    #[serde(default)]
    version: Option<Version>,
}

#[derive(Deserialize, Debug)]
enum Step {
    Node(NodeEvent),
    Remove(RemovalSelector),

    /// The entries of a flow on `switch` time out.
    Expire { switch: SwitchId, flow_id: FlowId },

    /// The table-miss entry on `switch` goes away.
    ExpireTableMiss { switch: SwitchId },
}

#[derive(Serialize, Debug)]
struct SwitchReport {
    id: SwitchId,
    table_miss: Option<TableMissState>,
    entries: Vec<FlowEntry>,
}

#[derive(Serialize, Debug)]
struct Report {
    flows: Vec<DataFlow>,
    switches: Vec<SwitchReport>,
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

async fn run_step(manager: &FlowManager, fabric: &Fabric, step: Step) -> Result<()> {
    match step {
        Step::Node(node_event) => {
            match &node_event {
                NodeEvent::NodeUpdated { switch, version } => fabric.add_switch(*switch, *version),
                NodeEvent::NodeRemoved { switch } => fabric.remove_switch(*switch),
                _ => (),
            }
            let removed = manager.handle_node_event(node_event).await?;
            if !removed.is_empty() {
                event!(Level::INFO, "removed {} flows", removed.len());
            }
        }
        Step::Remove(selector) => {
            let removed = manager.remove_flows(selector).await?;
            event!(Level::INFO, "removed {} flows", removed.len());
        }
        Step::Expire { switch, flow_id } => match fabric.expire(switch, Cookie::for_flow(flow_id)) {
            Some(removed) => {
                let outcome = manager.flow_removed(removed).await?;
                event!(Level::INFO, "{switch}: flow {flow_id} expired ({outcome:?})");
            }
            None => event!(Level::WARN, "{switch}: has no entry for flow {flow_id}"),
        },
        Step::ExpireTableMiss { switch } => match fabric.expire(switch, Cookie::TABLE_MISS) {
            Some(removed) => {
                let outcome = manager.flow_removed(removed).await?;
                event!(Level::INFO, "{switch}: table-miss entry expired ({outcome:?})");
            }
            None => event!(Level::WARN, "{switch}: has no table-miss entry"),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log.as_deref());

    let config = match &args.config {
        Some(path) => FlowConfig::load(path).with_context(|| format!("{}: bad configuration", path.display()))?,
        None => FlowConfig::default(),
    };
    let scenario = std::fs::read_to_string(&args.scenario)
        .with_context(|| format!("{}: could not read scenario", args.scenario.display()))?;
    let scenario: Scenario = serde_json::from_str(&scenario)
        .with_context(|| format!("{}: could not parse scenario", args.scenario.display()))?;

    let fabric = Arc::new(Fabric::new());
    for switch in &scenario.switches {
        fabric.add_switch(switch.id, switch.version);
    }
    let manager = FlowManager::init(config, Arc::new(MemStore::new()), fabric.clone(), fabric.clone())
        .context("could not start flow manager")?;

    for switch in &scenario.switches {
        manager.handle_node_event(NodeEvent::NodeUpdated { switch: switch.id, version: switch.version }).await?;
    }
    for desc in scenario.flows {
        let match_key = desc.match_key.clone();
        match manager.add_flow(desc).await {
            Ok(outcome) => event!(Level::INFO, "{match_key}: {outcome:?}"),
            Err(error) => event!(Level::WARN, "{match_key}: {error}"),
        }
    }
    for step in scenario.steps {
        if let Err(error) = run_step(&manager, &fabric, step).await {
            event!(Level::WARN, "step failed ({error:#})");
        }
    }

    let report = Report {
        flows: manager.list_flows(&FlowFilter::default())?,
        switches: fabric
            .switches()
            .into_iter()
            .map(|id| SwitchReport { id, table_miss: manager.table_miss_state(id), entries: fabric.entries(id) })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown().await;
    Ok(())
}
