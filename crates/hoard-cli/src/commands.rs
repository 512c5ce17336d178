use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use colored::Colorize;
use hoard_sdk::{ObjectId, ObjectState, StoreClient};
use hoard_server::{ServerConfig, StoreServer};
use serde_json::json;

use crate::cli::{
    Cli, Command, ConfigArgs, GetArgs, IdArgs, OutputFormat, PutArgs, TransferArgs, WatchArgs,
};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        socket,
        format,
        ..
    } = cli;
    match command {
        Command::Serve(args) => cmd_serve(load_config(&args, socket)?).await,
        Command::Info(args) => cmd_info(&load_config(&args, socket)?, format),
        Command::Put(args) => cmd_put(socket_path(socket), args, format).await,
        Command::Get(args) => cmd_get(socket_path(socket), args).await,
        Command::Contains(args) => cmd_contains(socket_path(socket), args, format).await,
        Command::Delete(args) => cmd_delete(socket_path(socket), args, format).await,
        Command::Transfer(args) => cmd_transfer(socket_path(socket), args, format).await,
        Command::Watch(args) => cmd_watch(socket_path(socket), args, format).await,
    }
}

/// Config file (or defaults) with command-line overrides applied.
fn load_config(args: &ConfigArgs, socket: Option<PathBuf>) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServerConfig::default(),
    };
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(size) = args.arena_size {
        config.arena_size = size;
    }
    if let Some(dir) = &args.arena_dir {
        config.arena_dir = dir.clone();
    }
    if let Some(addr) = args.manager_addr {
        config.manager_addr = Some(addr);
    }
    if let Some(port) = args.manager_port {
        config.manager_port = Some(port);
    }
    if let Some(ms) = args.get_timeout_ms {
        config.get_timeout_ms = ms;
    }
    if let Some(ms) = args.transfer_timeout_ms {
        config.transfer_timeout_ms = ms;
    }
    if let Some(ms) = args.write_timeout_ms {
        config.write_timeout_ms = ms;
    }
    if let Some(capacity) = args.notification_capacity {
        config.notification_capacity = capacity;
    }
    if let Some(limit) = args.max_connections {
        config.max_connections = limit;
    }
    Ok(config)
}

fn socket_path(socket: Option<PathBuf>) -> PathBuf {
    socket.unwrap_or_else(|| ServerConfig::default().socket_path)
}

fn parse_id(text: &str) -> anyhow::Result<ObjectId> {
    ObjectId::from_hex(text).with_context(|| format!("invalid object id '{text}'"))
}

async fn connect(socket: PathBuf) -> anyhow::Result<StoreClient> {
    StoreClient::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

async fn cmd_serve(config: ServerConfig) -> anyhow::Result<()> {
    let server = StoreServer::bind(config).await?;
    println!(
        "{} Serving on {}",
        "✓".green().bold(),
        server.socket_path().display().to_string().cyan()
    );
    if let Some(addr) = server.transfer_addr() {
        println!("  transfers on {}", addr.to_string().cyan());
    }
    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn cmd_info(config: &ServerConfig, format: OutputFormat) -> anyhow::Result<()> {
    config.validate()?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        OutputFormat::Text => print!("{}", config.to_toml()?),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

async fn cmd_put(socket: PathBuf, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = match &args.id {
        Some(text) => parse_id(text)?,
        None => ObjectId::random(),
    };
    let data = match &args.file {
        Some(path) => std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            buf
        }
    };

    let mut client = connect(socket).await?;
    client.put(id, &data, args.metadata.as_bytes()).await?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "id": id.to_hex(), "size": data.len(), "metadata": args.metadata })
        ),
        OutputFormat::Text => println!(
            "{} Sealed {} ({} bytes)",
            "✓".green().bold(),
            id.to_hex().yellow(),
            data.len()
        ),
    }
    Ok(())
}

async fn cmd_get(socket: PathBuf, args: GetArgs) -> anyhow::Result<()> {
    let id = parse_id(&args.id)?;
    let mut client = connect(socket).await?;
    let (data, _metadata) = client
        .fetch(id, args.timeout_ms.map(Duration::from_millis))
        .await?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &data)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "{} Wrote {} bytes to {}",
                "✓".green().bold(),
                data.len(),
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn cmd_contains(socket: PathBuf, args: IdArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(&args.id)?;
    let mut client = connect(socket).await?;
    let state = client.status(id).await?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({
                "id": id.to_hex(),
                "present": state.is_some(),
                "sealed": state == Some(ObjectState::Sealed),
            })
        ),
        OutputFormat::Text => match state {
            Some(ObjectState::Sealed) => println!("{} {}", id.to_hex().yellow(), "sealed".green()),
            Some(ObjectState::Created) => println!("{} {}", id.to_hex().yellow(), "unsealed".cyan()),
            None => println!("{} {}", id.to_hex().yellow(), "absent".red()),
        },
    }
    Ok(())
}

async fn cmd_delete(socket: PathBuf, args: IdArgs, format: OutputFormat) -> anyhow::Result<()> {
    let id = parse_id(&args.id)?;
    let mut client = connect(socket).await?;
    client.delete(id).await?;

    match format {
        OutputFormat::Json => println!("{}", json!({ "id": id.to_hex(), "deleted": true })),
        OutputFormat::Text => println!("{} Deleted {}", "✓".green().bold(), id.to_hex().yellow()),
    }
    Ok(())
}

async fn cmd_transfer(
    socket: PathBuf,
    args: TransferArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let id = parse_id(&args.id)?;
    let mut client = connect(socket).await?;
    client.transfer(args.peer, id).await?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            json!({ "id": id.to_hex(), "peer": args.peer.to_string() })
        ),
        OutputFormat::Text => println!(
            "{} Transferred {} to {}",
            "✓".green().bold(),
            id.to_hex().yellow(),
            args.peer.to_string().cyan()
        ),
    }
    Ok(())
}

async fn cmd_watch(socket: PathBuf, args: WatchArgs, format: OutputFormat) -> anyhow::Result<()> {
    let client = connect(socket).await?;
    let mut notifications = client.subscribe().await?;
    if format == OutputFormat::Text {
        eprintln!("{} Watching for sealed objects", "→".cyan().bold());
    }

    let mut seen = 0usize;
    while args.count.map_or(true, |limit| seen < limit) {
        let Some(id) = notifications.next().await? else {
            break;
        };
        seen += 1;
        match format {
            OutputFormat::Json => println!("{}", json!({ "sealed": id.to_hex() })),
            OutputFormat::Text => println!("{}", id.to_hex()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hoard.toml");
        std::fs::write(&path, "arena_size = 8192\nget_timeout_ms = 5\n").unwrap();

        let args = ConfigArgs {
            config: Some(path),
            get_timeout_ms: Some(250),
            transfer_timeout_ms: Some(1_500),
            write_timeout_ms: Some(750),
            max_connections: Some(8),
            manager_port: Some(7000),
            ..ConfigArgs::default()
        };
        let config = load_config(&args, Some(PathBuf::from("/tmp/other.sock"))).unwrap();
        assert_eq!(config.arena_size, 8192);
        assert_eq!(config.get_timeout_ms, 250);
        assert_eq!(config.transfer_timeout_ms, 1_500);
        assert_eq!(config.write_timeout_ms, 750);
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.manager_port, Some(7000));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/hoard.toml")),
            ..ConfigArgs::default()
        };
        assert!(load_config(&args, None).is_err());
    }

    #[test]
    fn default_socket_comes_from_config() {
        assert_eq!(socket_path(None), ServerConfig::default().socket_path);
    }

    #[test]
    fn id_parsing() {
        let id = ObjectId::random();
        assert_eq!(parse_id(&id.to_hex()).unwrap(), id);
        assert!(parse_id("xyz").is_err());
        assert!(parse_id("0102").is_err());
    }

    #[tokio::test]
    async fn put_then_contains_against_live_server() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            socket_path: dir.path().join("hoard.sock"),
            arena_size: 1 << 16,
            arena_dir: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let socket = config.socket_path.clone();
        let server = StoreServer::bind(config).await.unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));

        let file = dir.path().join("payload.bin");
        std::fs::write(&file, b"hello hoard").unwrap();
        let id = ObjectId::random();
        cmd_put(
            socket.clone(),
            PutArgs {
                id: Some(id.to_hex()),
                file: Some(file),
                metadata: "v1".into(),
            },
            OutputFormat::Json,
        )
        .await
        .unwrap();

        let mut client = StoreClient::connect(&socket).await.unwrap();
        assert_eq!(client.status(id).await.unwrap(), Some(ObjectState::Sealed));

        let out = dir.path().join("out.bin");
        cmd_get(
            socket.clone(),
            GetArgs {
                id: id.to_hex(),
                timeout_ms: Some(0),
                output: Some(out.clone()),
            },
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello hoard");

        cmd_delete(socket.clone(), IdArgs { id: id.to_hex() }, OutputFormat::Text)
            .await
            .unwrap();
        assert_eq!(client.status(id).await.unwrap(), None);

        stop.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
