use std::path::{Path, PathBuf};

use facet::Facet;
use figue as args;
use heapscope_dump::report::{
    counts_table, gaps_list, location_delta_table, objects_table, type_delta_table,
};
use heapscope_dump::{
    CaptureOptions, Comparison, MemoryProxy, capture_snapshot, default_addr, load_snapshot,
    save_snapshot, snapshot_file_name, unix_millis_now,
};
use heapscope_types::ObjectAddress;
use tracing::info;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::subcommand)]
    command: Command,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum Command {
    Counts {
        #[facet(args::named, default)]
        addr: Option<String>,
    },
    Objects {
        #[facet(args::named, default)]
        addr: Option<String>,
        #[facet(args::named)]
        type_name: String,
    },
    FindPath {
        #[facet(args::named, default)]
        addr: Option<String>,
        #[facet(args::named)]
        address: String,
    },
    Gc {
        #[facet(args::named, default)]
        addr: Option<String>,
    },
    Snapshot {
        #[facet(args::named, default)]
        addr: Option<String>,
        #[facet(args::named, default)]
        out_dir: Option<String>,
        #[facet(args::named, default)]
        no_gc: bool,
    },
    Diff {
        #[facet(args::named)]
        prior: String,
        #[facet(args::named, default)]
        current: Option<String>,
        #[facet(args::named, default)]
        type_name: Option<String>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;
    runtime.block_on(run_command(cli.command))
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("heapscope-dump")
                .description("Inspect, snapshot and diff the heap of a running heapscope host")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;
    Ok(cli.value)
}

async fn run_command(command: Command) -> Result<(), String> {
    match command {
        Command::Counts { addr } => {
            let mut proxy = connect(addr).await?;
            let counts = proxy
                .get_objects_counts()
                .await
                .map_err(|e| format!("count objects: {e}"))?;
            print!("{}", counts_table(&counts));
        }
        Command::Objects { addr, type_name } => {
            let mut proxy = connect(addr).await?;
            let objects = proxy
                .get_objects(&type_name)
                .await
                .map_err(|e| format!("list {type_name}: {e}"))?;
            if objects.is_empty() {
                println!("no live {type_name} objects");
            }
            print!("{}", objects_table(&objects));
        }
        Command::FindPath { addr, address } => {
            let address = ObjectAddress::parse(&address).map_err(|e| e.to_string())?;
            let mut proxy = connect(addr).await?;
            let path = proxy
                .find_object_path(address)
                .await
                .map_err(|e| format!("find path to {address}: {e}"))?;
            if path.is_empty() {
                println!("{address} is not reachable from the root");
            } else {
                println!("{path}");
            }
        }
        Command::Gc { addr } => {
            let mut proxy = connect(addr).await?;
            proxy.run_gc().await.map_err(|e| format!("run gc: {e}"))?;
            println!("collection finished");
        }
        Command::Snapshot {
            addr,
            out_dir,
            no_gc,
        } => {
            let target = addr.unwrap_or_else(default_addr);
            let mut proxy = connect(Some(target.clone())).await?;
            let options = CaptureOptions {
                collect_first: !no_gc,
            };
            let report = capture_snapshot(&mut proxy, &options)
                .await
                .map_err(|e| format!("capture snapshot from {target}: {e}"))?;

            let dir = PathBuf::from(out_dir.unwrap_or_else(|| ".".to_string()));
            std::fs::create_dir_all(&dir)
                .map_err(|e| format!("create {}: {e}", dir.display()))?;
            let path = dir.join(snapshot_file_name(&target, unix_millis_now()));
            save_snapshot(&path, &report.snapshot).map_err(|e| e.to_string())?;
            info!(path = %path.display(), "snapshot written");

            eprint!("{}", gaps_list(&report.gaps));
            println!(
                "{} ({} types, {} instances)",
                path.display(),
                report.snapshot.types.len(),
                report.snapshot.total_instances()
            );
        }
        Command::Diff {
            prior,
            current,
            type_name,
        } => {
            let mut comparison = Comparison::new();
            let initial = load_snapshot(Path::new(&prior)).map_err(|e| e.to_string())?;
            comparison.set_initial(initial);
            if let Some(current) = current {
                let current = load_snapshot(Path::new(&current)).map_err(|e| e.to_string())?;
                comparison.set_current(current);
            }
            match type_name {
                Some(type_name) => print!(
                    "{}",
                    location_delta_table(&comparison.location_rows(&type_name))
                ),
                None => print!("{}", type_delta_table(&comparison.type_rows())),
            }
        }
    }
    Ok(())
}

async fn connect(addr: Option<String>) -> Result<MemoryProxy, String> {
    let addr = addr.unwrap_or_else(default_addr);
    MemoryProxy::connect(&addr).await.map_err(|e| e.to_string())
}
