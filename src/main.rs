use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser};
use log::{error, info};
use proxmox_lifecycle_mcp::cli::{Args, Commands, ServerKind};
use proxmox_lifecycle_mcp::lifecycle::Orchestrator;
use proxmox_lifecycle_mcp::logging::{self, FileLog, LogOptions};
use proxmox_lifecycle_mcp::mcp::McpServer;
use proxmox_lifecycle_mcp::proxmox::{HttpTransport, ProxmoxClient};
use proxmox_lifecycle_mcp::settings::{Auth, ServerType, Settings};
use proxmox_lifecycle_mcp::tools::Dispatcher;
use std::process;
use std::sync::Arc;

const DEFAULT_PORT: u16 = 8006;
const DEFAULT_HTTP_HOST: &str = "127.0.0.1";
const DEFAULT_HTTP_PORT: u16 = 3000;

/// CLI flags win over the config file and environment.
fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(host) = &args.host {
        settings.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        settings.port = Some(port);
    }
    if let Some(user) = &args.user {
        settings.user = Some(user.clone());
    }
    if let Some(password) = &args.password {
        settings.password = Some(password.clone());
    }
    if let Some(token_name) = &args.token_name {
        settings.token_name = Some(token_name.clone());
    }
    if let Some(token_value) = &args.token_value {
        settings.token_value = Some(token_value.clone());
    }
    // A false flag is the default, so it never overrides the file.
    if args.no_verify_ssl {
        settings.no_verify_ssl = Some(true);
    }
    if let Some(kind) = args.server_type {
        settings.server_type = Some(match kind {
            ServerKind::Stdio => ServerType::Stdio,
            ServerKind::Http => ServerType::Http,
        });
    }
    if let Some(h) = &args.http_host {
        settings.http_host = Some(h.clone());
    }
    if let Some(p) = args.http_port {
        settings.http_port = Some(p);
    }
    if let Some(t) = &args.http_auth_token {
        settings.http_auth_token = Some(t.clone());
    }
    if let Some(secs) = args.task_timeout {
        settings.task.timeout_secs = secs;
    }
    if let Some(ms) = args.poll_interval_ms {
        settings.task.poll_interval_ms = ms;
    }
}

async fn connect(settings: &Settings) -> Result<ProxmoxClient> {
    let host = settings.host.as_deref().ok_or_else(|| anyhow!("Host is required"))?;
    let user = settings.user.as_deref().ok_or_else(|| anyhow!("User is required"))?;
    let verify_ssl = !settings.no_verify_ssl.unwrap_or(false);

    info!("Connecting to Proxmox at {}", host);
    let mut transport = HttpTransport::new(host, settings.port.unwrap_or(DEFAULT_PORT), verify_ssl)
        .context("Failed to create client")?;

    match settings.auth() {
        Some(Auth::Token { name, value }) => {
            info!("Using API Token authentication");
            transport.set_api_token(user, name, value);
        }
        Some(Auth::Password(password)) => {
            transport
                .login(user, password)
                .await
                .context("Authentication failed")?;
        }
        None => return Err(anyhow!("No authentication method provided")),
    }

    Ok(ProxmoxClient::new(Arc::new(transport)))
}

async fn run(args: Args) -> Result<()> {
    let mut settings = Settings::new(args.config.as_deref()).context("Failed to load configuration")?;
    apply_overrides(&mut settings, &args);
    settings
        .validate()
        .map_err(|e| anyhow!("Configuration error: {}", e))?;

    let client = connect(&settings).await?;
    let orchestrator = Orchestrator::new(
        client,
        settings.policy.clone(),
        settings.task.budget(),
        settings.task.backoff_cap,
    );
    let server = McpServer::new(Dispatcher::new(orchestrator));

    match settings.server_type.unwrap_or_default() {
        ServerType::Stdio => {
            info!("Starting MCP Server (stdio transport)...");
            server.run_stdio().await
        }
        ServerType::Http => {
            let host = settings.http_host.as_deref().unwrap_or(DEFAULT_HTTP_HOST);
            let port = settings.http_port.unwrap_or(DEFAULT_HTTP_PORT);
            info!("Starting MCP Server (http transport)...");
            server
                .run_http(host, port, settings.http_auth_token.clone())
                .await
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Some(Commands::Completions { shell }) = &args.command {
        let mut cmd = Args::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(*shell, &mut cmd, name, &mut std::io::stdout());
        return;
    }

    let log_opts = LogOptions {
        level: args.log_level.clone(),
        file: args.log_file_enable.then(|| FileLog {
            dir: args.log_dir.clone(),
            filename: args.log_filename.clone(),
            rotate: args.log_rotate.clone(),
        }),
    };
    let _guard = match logging::init(&log_opts) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}
