use std::path::PathBuf;

use serde_json::json;
use toolsession::{
    load_servers, select_server, InvocationReport, InvocationRequest, ServerConfig, SessionError,
    ToolSession,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Options {
    server_file: Option<PathBuf>,
    server_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("toolsession=debug,info")),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("toolsession demo failed: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let Some(options) = parse_args()? else {
        print_help();
        return Ok(());
    };

    let server = match &options.server_file {
        Some(path) => load_servers(path)
            .and_then(|servers| select_server(servers, options.server_id.as_deref())),
        None => ServerConfig::from_env(),
    }
    .map_err(|e| e.to_string())?;

    println!("Using server '{}' over {}", server.name, server.transport);
    let transport = server.build_transport().map_err(|e| e.to_string())?;
    let session = ToolSession::with_config(transport, server.session_config());

    let outcome = drive(&session).await;
    if let Err(error) = session.close().await {
        eprintln!("closing session failed: {error}");
    }
    outcome
}

fn parse_args() -> Result<Option<Options>, String> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            "--server" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--server requires a value".to_string())?;
                options.server_file = Some(PathBuf::from(value));
            }
            "--id" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--id requires a value".to_string())?;
                options.server_id = Some(value);
            }
            other => {
                if let Some(value) = other.strip_prefix("--server=") {
                    options.server_file = Some(PathBuf::from(value));
                } else if let Some(value) = other.strip_prefix("--id=") {
                    options.server_id = Some(value.to_string());
                } else {
                    return Err(format!("unknown argument '{other}'. Use --help for usage"));
                }
            }
        }
    }

    if options.server_id.is_some() && options.server_file.is_none() {
        return Err("--id requires --server".to_string());
    }
    Ok(Some(options))
}

fn print_help() {
    println!(
        "toolsession_demo\n\n\
         Opens a session, lists tools, and runs the sample calls.\n\n\
         USAGE:\n  toolsession_demo [--server <servers.json>] [--id <server id>]\n\n\
         Without --server the server comes from TOOLSESSION_COMMAND / TOOLSESSION_ARGS\n\
         or TOOLSESSION_URL (a .env file is read). TOOLSESSION_TIMEOUT_SECS sets the\n\
         per-operation bound; RUST_LOG controls logging."
    );
}

fn sample_requests() -> Vec<InvocationRequest> {
    vec![
        InvocationRequest::new(
            "searchNearby",
            json!({ "location": "東京駅", "radius": 1000, "keyword": "レストラン" }),
        ),
        InvocationRequest::new(
            "getDirections",
            json!({ "origin": "東京駅", "destination": "秋葉原駅", "mode": "transit" }),
        ),
    ]
}

async fn drive(session: &ToolSession) -> Result<(), String> {
    session
        .open(None)
        .await
        .map_err(|e| format!("failed to open session: {e}"))?;

    if let Some(info) = session.server_info().await {
        println!("Connected to {} {}", info.name, info.version);
    }
    if let Some(instructions) = session.instructions().await {
        println!("Server instructions: {instructions}");
    }

    let catalog = session
        .list_tools(None)
        .await
        .map_err(|e| format!("failed to list tools: {e}"))?;
    println!("Available tools ({}):", catalog.len());
    for tool in catalog.iter() {
        println!(
            "  - {}: {}",
            tool.name,
            tool.description.as_deref().unwrap_or("(no description)")
        );
    }

    for request in sample_requests() {
        let result = session.invoke_request(&request, None).await;

        match &result {
            Err(SessionError::UnknownTool { name }) => {
                println!("Skipping '{name}': not offered by this server");
                continue;
            }
            Err(SessionError::ArgumentValidation { reason, .. }) => {
                println!(
                    "'{}' rejected its arguments at {}",
                    request.tool_name,
                    reason.path().unwrap_or("(top level)")
                );
            }
            Err(SessionError::RemoteExecution { code, .. }) => {
                println!("'{}' failed remotely (code {:?})", request.tool_name, code);
            }
            Err(SessionError::Timeout { timeout, .. }) => {
                println!("'{}' gave no answer within {:?}", request.tool_name, timeout);
            }
            Err(SessionError::Connection(_)) | Err(SessionError::Protocol(_)) => {
                let report = InvocationReport::from(&result);
                println!("{}: {}", request.tool_name, to_json(&report)?);
                return Err(format!("session lost during '{}'", request.tool_name));
            }
            _ => {}
        }

        let report = InvocationReport::from(result);
        println!("{}: {}", request.tool_name, to_json(&report)?);
    }

    let stats = session.statistics().await;
    println!(
        "{} call(s), {:.0}% succeeded, {:.1}ms average",
        stats.total_tool_calls,
        stats.success_rate(),
        stats.avg_response_time_ms
    );
    Ok(())
}

fn to_json(report: &InvocationReport) -> Result<String, String> {
    serde_json::to_string_pretty(report).map_err(|e| format!("failed to render report: {e}"))
}
