//! virtkube CLI

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};

use virtkube::manager::DEFAULT_SWEEP_INTERVAL;
use virtkube::scaling::executor::ExecutorPolicy;
use virtkube::{
    AutoScalingEngine, DecisionExecutor, EventDispatcher, HypervisorSession, MetaStore,
    RealTimeMonitor, VmConfig, VmManager,
};

#[derive(Parser)]
#[command(name = "virtkube")]
#[command(about = "Single-host KVM/QEMU orchestrator with autoscaling", long_about = None)]
struct Cli {
    /// Hypervisor URI
    #[arg(long, default_value = "qemu:///system")]
    uri: String,
    /// State database path
    #[arg(long, default_value = "/var/lib/virtkube/state.db")]
    state: PathBuf,
    /// Cgroup hierarchy root
    #[arg(long, default_value = "/sys/fs/cgroup")]
    cgroup_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a VM from a JSON config file
    Deploy {
        /// Path to a VmConfig JSON document
        config: PathBuf,
    },
    /// List all known VMs
    List,
    /// Start a defined VM
    Start { name: String },
    /// Request a guest shutdown
    Shutdown { name: String },
    /// Hard-stop a VM
    Stop { name: String },
    /// Pause a running VM
    Pause { name: String },
    /// Resume a paused VM
    Resume { name: String },
    /// Reboot a running VM
    Reboot { name: String },
    /// Destroy and undefine a VM
    Delete {
        name: String,
        /// Also remove file-backed volumes
        #[arg(long)]
        storage: bool,
    },
    /// Change the vCPU count or memory of a running VM
    Scale {
        name: String,
        #[arg(long)]
        cpus: Option<u16>,
        /// Memory in MiB
        #[arg(long)]
        memory: Option<u64>,
    },
    /// Live-migrate a VM to another host
    Migrate { name: String, dest_uri: String },
    /// Attach a network interface to a running VM
    AttachNic {
        name: String,
        /// Network name (or bridge device with --bridge)
        source: String,
        #[arg(long)]
        bridge: bool,
        #[arg(long, default_value = "virtio")]
        model: String,
    },
    /// Detach a network interface by MAC address
    DetachNic {
        name: String,
        mac: String,
        /// Network name (or bridge device with --bridge)
        source: String,
        #[arg(long)]
        bridge: bool,
        #[arg(long, default_value = "virtio")]
        model: String,
    },
    /// Snapshot operations
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
    /// Show current metrics for one VM or the host
    Metrics { name: Option<String> },
    /// Run the monitor, autoscaler and executor until interrupted
    Watch {
        /// Destination for migrate decisions
        #[arg(long)]
        migrate_dest: Option<String>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    Create {
        vm: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    Revert {
        vm: String,
        name: String,
    },
    List {
        vm: String,
    },
}

#[derive(Tabled)]
struct VmRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "VCPUS")]
    vcpus: u16,
    #[tabled(rename = "MEMORY")]
    memory: String,
    #[tabled(rename = "PORT")]
    port: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    if let Some(parent) = cli.state.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let session = Arc::new(HypervisorSession::new(&cli.uri));
    let store = MetaStore::open(&cli.state)?;
    let dispatcher = Arc::new(EventDispatcher::new(0));
    let manager = VmManager::new(session, store.clone(), Arc::clone(&dispatcher), &cli.cgroup_root);

    match cli.command {
        Commands::Deploy { config } => {
            let json = std::fs::read_to_string(&config)?;
            let config: VmConfig = serde_json::from_str(&json)?;
            let name = config.name.clone();
            let id = manager.deploy(config)?;
            println!("Deployed '{name}' with id {id}");
        }
        Commands::List => {
            let rows: Vec<VmRow> = manager
                .list_all()?
                .into_iter()
                .map(|v| VmRow {
                    id: v.id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    name: v.name,
                    state: v.state.to_string(),
                    vcpus: v.vcpus,
                    memory: format!("{} MiB", v.memory_mib),
                    port: v
                        .reserved_port
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".into()),
                })
                .collect();
            if rows.is_empty() {
                println!("No VMs found.");
            } else {
                println!("{}", Table::new(rows));
            }
        }
        Commands::Start { name } => {
            manager.start(&name)?;
            println!("Started '{name}'");
        }
        Commands::Shutdown { name } => {
            manager.shutdown(&name)?;
            println!("Shutdown requested for '{name}'");
        }
        Commands::Stop { name } => {
            manager.destroy(&name)?;
            println!("Stopped '{name}'");
        }
        Commands::Pause { name } => {
            use virtkube::scaling::executor::ScalingBackend;
            manager.pause(&name)?;
            println!("Paused '{name}'");
        }
        Commands::Resume { name } => {
            use virtkube::scaling::executor::ScalingBackend;
            manager.resume(&name)?;
            println!("Resumed '{name}'");
        }
        Commands::Reboot { name } => {
            manager.reboot(&name)?;
            println!("Rebooted '{name}'");
        }
        Commands::Delete { name, storage } => {
            manager.delete(&name, storage)?;
            println!("Deleted '{name}'");
        }
        Commands::Scale { name, cpus, memory } => {
            use virtkube::scaling::executor::ScalingBackend;
            if cpus.is_none() && memory.is_none() {
                return Err("pass --cpus and/or --memory".into());
            }
            if let Some(cpus) = cpus {
                manager.scale_cpu(&name, cpus)?;
                println!("Scaled '{name}' to {cpus} vCPUs");
            }
            if let Some(memory) = memory {
                manager.scale_memory(&name, memory)?;
                println!("Scaled '{name}' to {memory} MiB");
            }
        }
        Commands::Migrate { name, dest_uri } => {
            use virtkube::scaling::executor::ScalingBackend;
            manager.migrate(&name, &dest_uri)?;
            println!("Migrated '{name}' to {dest_uri}");
        }
        Commands::AttachNic {
            name,
            source,
            bridge,
            model,
        } => {
            let nic = virtkube::NicSpec {
                kind: if bridge {
                    virtkube::config::NicKind::Bridge
                } else {
                    virtkube::config::NicKind::Network
                },
                source,
                model,
                mac: None,
            };
            manager.get(&name)?.attach_nic(&nic)?;
            println!("NIC attached to '{name}'");
        }
        Commands::DetachNic {
            name,
            mac,
            source,
            bridge,
            model,
        } => {
            let nic = virtkube::NicSpec {
                kind: if bridge {
                    virtkube::config::NicKind::Bridge
                } else {
                    virtkube::config::NicKind::Network
                },
                source,
                model,
                mac: Some(mac),
            };
            manager.get(&name)?.detach_nic(&nic)?;
            println!("NIC detached from '{name}'");
        }
        Commands::Snapshot { command } => match command {
            SnapshotCommands::Create {
                vm,
                name,
                description,
            } => {
                manager.snapshot_create(&vm, &name, &description)?;
                println!("Created snapshot '{name}' for '{vm}'");
            }
            SnapshotCommands::Revert { vm, name } => {
                manager.snapshot_revert(&vm, &name)?;
                println!("Reverted '{vm}' to snapshot '{name}'");
            }
            SnapshotCommands::List { vm } => {
                let snapshots = manager.get(&vm)?.snapshots();
                if snapshots.is_empty() {
                    println!("No snapshots for '{vm}'.");
                }
                for s in snapshots {
                    println!("{}  {}  {}", s.name, s.created_at.to_rfc3339(), s.description);
                }
            }
        },
        Commands::Metrics { name } => {
            let monitor = RealTimeMonitor::new(Arc::clone(&manager));
            monitor.start();
            // two ticks so rates have a delta to diff against
            std::thread::sleep(Duration::from_millis(2500));
            match name {
                Some(name) => match monitor.vm_metrics(&name) {
                    Some(m) => {
                        println!("{name}:");
                        println!("  cpu: {:.1}% (5min avg {:.1}%)", m.usage.cpu_percent, m.cpu_avg_5min);
                        println!(
                            "  memory: {} / {} bytes",
                            m.usage.memory_bytes, m.usage.memory_max_bytes
                        );
                        println!(
                            "  io: {} B/s read, {} B/s write",
                            m.usage.io_read_bps, m.usage.io_write_bps
                        );
                        println!(
                            "  net: {} B/s rx, {} B/s tx",
                            m.usage.net_rx_bps, m.usage.net_tx_bps
                        );
                    }
                    None => println!("No metrics for '{name}' (is it running?)"),
                },
                None => {
                    let h = monitor.host_metrics();
                    println!("host:");
                    println!("  cpu: {:.1}% busy", h.cpu_load_1min);
                    println!(
                        "  memory: {} free / {} total bytes",
                        h.free_memory, h.total_memory
                    );
                    println!("  disk: {}% used", h.disk_usage_percent);
                }
            }
            monitor.stop();
        }
        Commands::Watch { migrate_dest } => {
            let monitor = Arc::new(RealTimeMonitor::new(Arc::clone(&manager)));
            let engine = Arc::new(AutoScalingEngine::new().with_store(store));
            let policy = ExecutorPolicy {
                migrate_dest_uri: migrate_dest,
                ..ExecutorPolicy::default()
            };
            let backend: Arc<dyn virtkube::scaling::executor::ScalingBackend> =
                Arc::clone(&manager) as Arc<dyn virtkube::scaling::executor::ScalingBackend>;
            let executor = Arc::new(DecisionExecutor::new(
                backend,
                Arc::clone(&dispatcher),
                policy,
            ));

            // register every known VM's limits with the engine
            for vm in manager.registered_vms() {
                engine.set_limits(vm.name(), vm.view().id, vm.limits());
            }

            // monitor -> engine -> executor
            let analyse = Arc::clone(&engine);
            monitor.register_metrics_callback(move |metrics| analyse.analyze(metrics));
            let exec = Arc::clone(&executor);
            engine.register_decision_callback(move |decision| exec.submit(decision.clone()));

            monitor.start();
            manager.start_maintenance_sweep(DEFAULT_SWEEP_INTERVAL);
            println!("Watching (ctrl-c to stop)...");

            install_sigint_flag();
            while !INTERRUPTED.load(std::sync::atomic::Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(200));
            }

            println!("Shutting down...");
            monitor.stop();
            executor.stop();
            manager.stop();
            dispatcher.stop();
        }
    }

    Ok(())
}

static INTERRUPTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    INTERRUPTED.store(true, std::sync::atomic::Ordering::SeqCst);
}

fn install_sigint_flag() {
    // an atomic store is async-signal-safe; the main loop polls the flag
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }
}
