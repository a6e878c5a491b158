use anyhow::Context;
use clap::Parser;
use gateway::{AllScopes, Dispatcher, Services, ToolFailure, ToolRequest};
use std::sync::Arc;
use tenancy::{ContextManager, CredentialStore, IdentityProvider};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Gateway is a daemon which exposes the edge control-plane APIs as a
/// tool-invocation protocol over stdin/stdout.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the INI credential file.
    #[clap(long = "credentials", env = "GATEWAY_CREDENTIALS", default_value = "~/.edgerc")]
    credentials: String,
    /// Path to an encrypted credential store; takes precedence over the
    /// INI file and requires CREDENTIAL_MASTER_KEY.
    #[clap(long = "secure-store", env = "GATEWAY_SECURE_STORE")]
    secure_store: Option<String>,
    /// Bearer token accepted for sessions. Generated and logged when
    /// unset (development mode).
    #[clap(long = "session-token", env = "GATEWAY_SESSION_TOKEN")]
    session_token: Option<String>,
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let config = gateway::GatewayConfig::from_env();
    let default_filter = if config.debug { "debug" } else { "info" };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(credentials = %args.credentials, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args, config).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args, config: gateway::GatewayConfig) -> Result<(), anyhow::Error> {
    let store = build_store(&args, &config)?;

    let (provider, token_hint) = build_identity_provider(&args, store.as_ref())?;
    if let Some(token) = token_hint {
        tracing::warn!(
            session_token = %token,
            "no session token configured; generated one for this process (development mode)"
        );
    }

    let contexts = Arc::new(ContextManager::new(
        store.as_ref(),
        provider,
        Arc::new(tenancy::AllowAll),
        edgegrid::Transport::new(),
    )?);
    tracing::info!(tenants = contexts.tenants().len(), "credential store loaded");

    let services = Services::wire(
        contexts,
        cache::SmartCache::new(cache::CacheConfig::from_env()),
        config.purge_config(),
        cert_deploy::CoordinatorConfig::default(),
    );
    services
        .start()
        .map_err(|err| anyhow::anyhow!("starting services: {err}"))?;

    let dispatcher = Arc::new(Dispatcher::new(services.clone(), Arc::new(AllScopes)));
    tracing::info!(tools = ?dispatcher.tool_names(), "dispatcher ready");

    serve(dispatcher).await;

    tracing::info!("shutting down");
    services.shutdown();
    Ok(())
}

fn build_store(
    args: &Args,
    config: &gateway::GatewayConfig,
) -> Result<Box<dyn CredentialStore>, anyhow::Error> {
    if let Some(path) = &args.secure_store {
        let key = config
            .credential_master_key
            .clone()
            .context("--secure-store requires CREDENTIAL_MASTER_KEY")?;
        return Ok(Box::new(tenancy::SecureStore::new(
            path.clone(),
            tenancy::MasterKey::new(key),
        )));
    }

    let path = shellexpand_home(&args.credentials);
    Ok(Box::new(tenancy::IniStore::new(path)))
}

/// The development identity provider: one bearer token granting every
/// configured tenant for twelve hours. Production deployments inject a
/// real provider instead.
fn build_identity_provider(
    args: &Args,
    store: &dyn CredentialStore,
) -> Result<(Arc<dyn IdentityProvider>, Option<String>), anyhow::Error> {
    let tenants: Vec<models::TenantId> = store
        .load()
        .map_err(|err| anyhow::anyhow!("loading credential store: {err}"))?
        .into_iter()
        .map(|bundle| bundle.tenant)
        .collect();

    let (token, hint) = match &args.session_token {
        Some(token) => (token.clone(), None),
        None => {
            let generated = uuid::Uuid::new_v4().to_string();
            (generated.clone(), Some(generated))
        }
    };

    let provider = tenancy::StaticIdentityProvider::default().with(
        token,
        tenancy::Identity {
            subject: "local-operator".to_string(),
            tenants,
            expires_at: chrono::Utc::now() + chrono::Duration::hours(12),
        },
    );
    Ok((Arc::new(provider), hint))
}

fn shellexpand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}/{rest}"),
        _ => path.to_string(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(flatten)]
    request: ToolRequest,
}

/// Serve line-delimited JSON tool invocations over stdin/stdout until
/// stdin closes or the process receives SIGINT.
async fn serve(dispatcher: Arc<Dispatcher>) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let stdout = Arc::new(tokio::sync::Mutex::new(tokio::io::stdout()));

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                return;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return, // stdin closed
            Err(err) => {
                tracing::error!(error = %err, "stdin read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let dispatcher = dispatcher.clone();
        let stdout = stdout.clone();
        tokio::spawn(async move {
            let (id, reply) = match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => {
                    let id = envelope.id.clone();
                    match dispatcher.dispatch(envelope.request).await {
                        Ok(response) => (id, serde_json::json!({ "result": response })),
                        Err(failure) => (id, serde_json::json!({ "error": failure })),
                    }
                }
                Err(err) => (
                    None,
                    serde_json::json!({
                        "error": ToolFailure {
                            code: "validation".to_string(),
                            message: format!("malformed request: {err}"),
                        }
                    }),
                ),
            };

            let mut reply = reply;
            if let (Some(id), Some(object)) = (id, reply.as_object_mut()) {
                object.insert("id".to_string(), id);
            }

            let mut line = reply.to_string();
            line.push('\n');
            let mut stdout = stdout.lock().await;
            if let Err(err) = stdout.write_all(line.as_bytes()).await {
                tracing::error!(error = %err, "stdout write failed");
            }
            let _ = stdout.flush().await;
        });
    }
}
