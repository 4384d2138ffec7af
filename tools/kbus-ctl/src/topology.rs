//! Topology files
//!
//! A topology describes the namespaces, buses and extra endpoints to
//! create, plus optional limits:
//!
//! ```toml
//! [limits]
//! max_queued_messages = 512
//!
//! [[namespace]]
//! name = "user"
//!
//! [[bus]]
//! name = "session"
//! namespace = "user"
//! mode = 0o660
//! uid = 1000
//! gid = 1000
//!
//! [[bus.endpoint]]
//! name = "sandbox"
//! mode = 0o600
//! uid = 1000
//! gid = 1000
//! ```

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use kbus::{Bus, BusConfig, BusFlags, Endpoint, Limits, Mode, Namespace, Subsystem};
use log::debug;
use serde::Deserialize;

const DEFAULT_MODE: u32 = 0o666;

fn default_mode() -> u32 {
    DEFAULT_MODE
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, rename = "namespace")]
    pub namespaces: Vec<NamespaceEntry>,
    #[serde(default, rename = "bus")]
    pub buses: Vec<BusEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceEntry {
    pub name: String,
    /// Parent namespace; the root when omitted
    #[serde(default)]
    pub parent: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusEntry {
    pub name: String,
    /// Owning namespace; the root when omitted
    #[serde(default)]
    pub namespace: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointEntry {
    pub name: String,
    #[serde(default = "default_mode")]
    pub mode: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
}

impl Topology {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid topology {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Instantiate the topology in a fresh subsystem
    pub fn build(&self) -> anyhow::Result<Arc<Subsystem>> {
        let subsystem = Subsystem::with_config(BusConfig {
            limits: self.limits.clone(),
        });

        for entry in &self.namespaces {
            let parent = subsystem
                .find_namespace(&entry.parent)
                .with_context(|| format!("parent of namespace '{}'", entry.name))?;
            subsystem.create_namespace(&parent, &entry.name, Mode::from_octal(entry.mode))?;
            debug!("topology: namespace '{}' under '{}'", entry.name, entry.parent);
        }

        for entry in &self.buses {
            let ns = subsystem
                .find_namespace(&entry.namespace)
                .with_context(|| format!("namespace of bus '{}'", entry.name))?;
            let bus = Bus::create(
                &ns,
                &entry.name,
                Mode::from_octal(entry.mode),
                BusFlags::from_bits_retain(entry.flags),
                entry.uid,
                entry.gid,
            )?;
            for ep in &entry.endpoints {
                Endpoint::create(&bus, &ep.name, Mode::from_octal(ep.mode), ep.uid, ep.gid)
                    .with_context(|| format!("endpoint '{}' on bus '{}'", ep.name, entry.name))?;
            }
        }

        Ok(subsystem)
    }
}

/// Render the namespace tree of `subsystem`
pub fn render(subsystem: &Subsystem) -> String {
    let mut out = String::new();
    render_namespace(&mut out, subsystem.root(), 0);
    out
}

fn render_namespace(out: &mut String, ns: &Arc<Namespace>, depth: usize) {
    let indent = "  ".repeat(depth);
    let label = if ns.is_root() { "<root>" } else { ns.name() };
    let _ = writeln!(
        out,
        "{}{} {} (major {}, {})",
        indent,
        "namespace".bold(),
        label.green(),
        ns.major(),
        ns.devpath()
    );

    for bus in ns.buses() {
        let _ = writeln!(
            out,
            "{}  {} {} (id {}, mode {:03o}, uid {})",
            indent,
            "bus".bold(),
            bus.name().cyan(),
            bus.id(),
            bus.access().mode.bits(),
            bus.access().uid
        );
        for ep in bus.endpoints() {
            let _ = writeln!(
                out,
                "{}    endpoint {} (minor {}, mode {:03o}{})",
                indent,
                ep.name().yellow(),
                ep.minor(),
                ep.access().mode.bits(),
                if ep.is_default() { ", default" } else { "" }
            );
        }
    }

    for child in ns.children() {
        render_namespace(out, &child, depth + 1);
    }
}
