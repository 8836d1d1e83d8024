//! arbor - hierarchical tree-automaton runtime
//!
//! Drives the bundled demo content from the command line and manages save
//! slots on disk.

mod config;
mod demo;

use arbor_core::{ActionStatus, Controller, VarTable};
use arbor_storage::SlotStore;
use clap::{Parser, Subcommand};
use config::Config;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Drive arbor demo content and manage save slots")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "ARBOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed inputs to the demo instances
    Run {
        /// Input as <system>:<input>; repeat for several steps
        #[arg(short, long = "input", value_name = "SYSTEM:INPUT")]
        inputs: Vec<String>,

        /// Resume from this slot if it exists, and save back to it afterwards
        #[arg(long)]
        slot: Option<String>,
    },

    /// Feed inputs, then save to a slot
    Save {
        /// Slot name
        slot: String,

        /// Input as <system>:<input>; repeat for several steps
        #[arg(short, long = "input", value_name = "SYSTEM:INPUT")]
        inputs: Vec<String>,
    },

    /// Load a slot and print every instance
    Load {
        /// Slot name
        slot: String,
    },

    /// List paths from an instance's current node to a target node
    Paths {
        /// Instance name
        #[arg(short, long)]
        instance: String,

        /// Persistent id of the target node
        #[arg(short, long)]
        target: String,

        /// Load this slot first
        #[arg(long)]
        slot: Option<String>,

        /// Maximum number of paths
        #[arg(long)]
        max_paths: Option<usize>,

        /// Maximum transitions per path
        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// List save slots
    Slots,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    tracing::debug!("Save directory: {}", config.storage.save_dir.display());

    let store = Arc::new(SlotStore::open(&config.storage.save_dir)?.with_format(config.storage.format));

    match cli.command {
        Commands::Run { inputs, slot } => {
            let mut controller = demo_controller(&config, &store)?;
            if let Some(slot) = &slot {
                resume(&mut controller, &store, slot)?;
            }
            run_inputs(&mut controller, &inputs)?;
            if let Some(slot) = &slot {
                controller.try_save(slot)?;
            }
            print_instances(&controller);
        }
        Commands::Save { slot, inputs } => {
            let mut controller = demo_controller(&config, &store)?;
            run_inputs(&mut controller, &inputs)?;
            controller.try_save(&slot)?;
            println!("saved slot {}", slot);
        }
        Commands::Load { slot } => {
            let mut controller = demo_controller(&config, &store)?;
            controller.try_load(&slot)?;
            print_instances(&controller);
        }
        Commands::Paths {
            instance,
            target,
            slot,
            max_paths,
            max_depth,
        } => {
            let mut controller = demo_controller(&config, &store)?;
            if let Some(slot) = &slot {
                controller.try_load(slot)?;
            }
            if !controller.can_reach_state(&instance, &target) {
                println!("{} cannot reach {}", instance, target);
                return Ok(());
            }
            let paths = controller.find_paths_to_state(&instance, &target, max_paths, max_depth);
            if paths.is_empty() {
                println!("{} can reach {}, but not within the depth limit", instance, target);
            }
            for (i, path) in paths.iter().enumerate() {
                println!("{}. [{} steps] {}", i + 1, path.len(), path.describe());
            }
        }
        Commands::Slots => {
            let slots = store.list();
            if slots.is_empty() {
                println!("no slots in {}", store.dir().display());
            }
            for meta in slots {
                println!(
                    "{:<16} {}  {:>8} bytes  {} instance(s)  {}  {}",
                    meta.slot,
                    meta.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    meta.size_bytes,
                    meta.instance_count,
                    meta.format,
                    meta.checksum
                );
            }
        }
    }

    Ok(())
}

fn demo_controller(config: &Config, store: &Arc<SlotStore>) -> Result<Controller, Box<dyn Error>> {
    let mut controller =
        Controller::new(config.controller.clone()).with_backend(Box::new(Arc::clone(store)));
    demo::build(&mut controller)?;
    demo::spawn_instances(&mut controller)?;
    Ok(controller)
}

fn resume(controller: &mut Controller, store: &SlotStore, slot: &str) -> Result<(), Box<dyn Error>> {
    if !store.exists(slot) {
        tracing::info!("Slot {} does not exist yet; starting fresh", slot);
        return Ok(());
    }
    controller.try_load(slot)?;
    // A slot saved before a system existed has no instance for it.
    demo::spawn_instances(controller)?;
    Ok(())
}

fn run_inputs(controller: &mut Controller, inputs: &[String]) -> Result<(), Box<dyn Error>> {
    for arg in inputs {
        let (instance, input) = arg
            .split_once(':')
            .ok_or_else(|| format!("expected <system>:<input>, got '{}'", arg))?;
        match controller.try_process_input(instance, input, VarTable::new())? {
            Some(step) => {
                let pid = |id| {
                    controller
                        .content()
                        .node(id)
                        .map(|n| n.persistent_id.clone())
                        .unwrap_or_default()
                };
                println!(
                    "{}: {} -> {} via {}",
                    instance,
                    pid(step.from),
                    pid(step.to),
                    step.transition_name
                );
            }
            None => println!("{}: '{}' took no transition", instance, input),
        }
    }
    Ok(())
}

fn print_instances(controller: &Controller) {
    for name in controller.instance_names() {
        let at = controller
            .current_node_id(name)
            .unwrap_or_else(|| "(not started)".to_string());
        println!("{} @ {}", name, at);
        for action in controller.available_actions(name) {
            let status = match action.status {
                ActionStatus::Available => "available",
                ActionStatus::Locked => "locked",
                ActionStatus::Completed => "done",
            };
            println!("    {:<10} {:<9} {}", action.name, status, action.description);
        }
    }
}
