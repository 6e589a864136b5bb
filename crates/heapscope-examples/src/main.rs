use facet::Facet;
use figue as args;
use heapscope::ServiceConfig;

mod scenarios;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::named, default)]
    listen: Option<String>,
    #[facet(args::named, default)]
    tick_ms: Option<u64>,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    LeakyListeners,
    CyclicScene,
}

type AnyResult<T> = Result<T, String>;

const DEFAULT_TICK_MS: u64 = 1_000;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = scenarios::Settings {
        service: config_from_cli(cli.listen),
        tick: std::time::Duration::from_millis(cli.tick_ms.unwrap_or(DEFAULT_TICK_MS).max(1)),
    };

    match cli.command {
        CommandKind::LeakyListeners => scenarios::leaky_listeners::run(settings).await,
        CommandKind::CyclicScene => scenarios::cyclic_scene::run(settings).await,
    }
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("heapscope-examples")
                .description("Run a demo host that serves its heap to heapscope-dump")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn config_from_cli(listen: Option<String>) -> ServiceConfig {
    let mut config = ServiceConfig::from_env();
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    config
}
