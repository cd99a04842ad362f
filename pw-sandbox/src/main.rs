use tracing_subscriber::EnvFilter;

use pw_sandbox::cli;
use pw_sandbox::Sandbox;

#[tokio::main]
async fn main() {
    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("pw-sandbox: {e}");
            eprintln!("{}", cli::USAGE);
            std::process::exit(2);
        }
    };

    // ── Logging: RUST_LOG wins, -d raises the default to debug ───────────────
    let default_level = if args.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(args).await {
        eprintln!("pw-sandbox: {e}");
        std::process::exit(1);
    }
}

async fn run(args: cli::CliArgs) -> Result<(), String> {
    let config = cli::load_config(&args).map_err(|e| e.to_string())?;
    let script = cli::read_script(&args.script).await.map_err(|e| e.to_string())?;
    let envs = cli::read_envs(args.envs_file.as_deref()).await.map_err(|e| e.to_string())?;

    let result = Sandbox::new(config).execute(&script, &envs).await?;

    println!("{}", cli::render_envs(&result, args.pretty).map_err(|e| e.to_string())?);
    Ok(())
}
