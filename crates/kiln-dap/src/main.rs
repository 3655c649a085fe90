use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use kiln_dap::debuggee::{
    ClassPathEntry, EvaluationClassLoader, JavaDebuggee, LaunchSpec, TestSelection, TestSuiteSpec,
};
use kiln_dap::{DebugServer, DebugServerConfig, DetachedBackend};

/// Kiln debug adapter.
///
/// Serves the Debug Adapter Protocol over TCP for a single debuggee
/// described by a JSON config file. The bound URI is printed on stdout; the
/// process exits when the debug session is over.
#[derive(Debug, Parser)]
#[command(name = "kiln-dap", version, about)]
struct Cli {
    /// Path to the debuggee config (JSON).
    debuggee: PathBuf,

    /// Interface to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on; 0 picks a free port.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Restart grace window in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    grace_period_ms: u64,

    /// Bound on launch/attach readiness in milliseconds.
    #[arg(long, default_value_t = 30_000)]
    launch_timeout_ms: u64,

    /// Keep listening after a session ends without restart intent instead
    /// of shutting down.
    #[arg(long)]
    keep_open: bool,

    /// Log filter.
    #[arg(long, env = "KILN_LOG", default_value = "info")]
    log: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
enum DebuggeeConfig {
    #[serde(rename_all = "camelCase")]
    Launch {
        name: Option<String>,
        main_class: String,
        #[serde(default)]
        class_path: Vec<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        jvm_options: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default = "default_suspend")]
        suspend: bool,
        #[serde(default)]
        evaluation_class_path: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Attach {
        name: Option<String>,
        #[serde(default = "default_host")]
        host: String,
        port: u16,
    },
    #[serde(rename_all = "camelCase")]
    TestSuite {
        name: Option<String>,
        runner_main_class: String,
        #[serde(default)]
        class_path: Vec<String>,
        selections: Vec<SelectionConfig>,
        #[serde(default)]
        jvm_options: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        evaluation_class_path: Vec<String>,
    },
}

#[derive(Debug, Deserialize)]
struct SelectionConfig {
    suite: String,
    #[serde(default)]
    tests: Vec<String>,
}

fn default_suspend() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn class_path_entries(paths: Vec<String>) -> Vec<ClassPathEntry> {
    paths
        .into_iter()
        .map(|path| {
            if path.ends_with(".jar") {
                ClassPathEntry::jar(path)
            } else {
                ClassPathEntry::directory(path)
            }
        })
        .collect()
}

fn env_pairs(env: BTreeMap<String, String>) -> Vec<(String, String)> {
    env.into_iter().collect()
}

impl DebuggeeConfig {
    fn into_debuggee(self) -> JavaDebuggee {
        match self {
            DebuggeeConfig::Launch {
                name,
                main_class,
                class_path,
                args,
                jvm_options,
                env,
                suspend,
                evaluation_class_path,
            } => {
                let name = name.unwrap_or_else(|| main_class.clone());
                let debuggee = JavaDebuggee::launch(
                    name,
                    class_path_entries(class_path),
                    LaunchSpec {
                        main_class,
                        args,
                        jvm_options,
                        env: env_pairs(env),
                        suspend,
                    },
                );
                with_class_loader(debuggee, evaluation_class_path)
            }
            DebuggeeConfig::Attach { name, host, port } => {
                let name = name.unwrap_or_else(|| format!("{host}:{port}"));
                JavaDebuggee::attach(name, host, port)
            }
            DebuggeeConfig::TestSuite {
                name,
                runner_main_class,
                class_path,
                selections,
                jvm_options,
                env,
                evaluation_class_path,
            } => {
                let name = name.unwrap_or_else(|| runner_main_class.clone());
                let debuggee = JavaDebuggee::test_suite(
                    name,
                    class_path_entries(class_path),
                    TestSuiteSpec {
                        runner_main_class,
                        selections: selections
                            .into_iter()
                            .map(|s| TestSelection {
                                suite: s.suite,
                                tests: s.tests,
                            })
                            .collect(),
                        jvm_options,
                        env: env_pairs(env),
                    },
                );
                with_class_loader(debuggee, evaluation_class_path)
            }
        }
    }
}

fn with_class_loader(debuggee: JavaDebuggee, class_path: Vec<String>) -> JavaDebuggee {
    if class_path.is_empty() {
        debuggee
    } else {
        debuggee.with_evaluation_class_loader(EvaluationClassLoader {
            class_path: class_path.into_iter().map(PathBuf::from).collect(),
        })
    }
}

fn init_logging(filter: &str) {
    // Logs go to stderr; stdout carries only the bound URI.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log);

    let config_text = std::fs::read_to_string(&cli.debuggee)
        .with_context(|| format!("failed to read {}", cli.debuggee.display()))?;
    let config: DebuggeeConfig = serde_json::from_str(&config_text)
        .with_context(|| format!("invalid debuggee config {}", cli.debuggee.display()))?;

    let server = DebugServer::bind(
        &cli.host,
        cli.port,
        Arc::new(config.into_debuggee()),
        Arc::new(DetachedBackend::new()),
        DebugServerConfig {
            grace_period: std::time::Duration::from_millis(cli.grace_period_ms),
            launch_timeout: std::time::Duration::from_millis(cli.launch_timeout_ms),
            auto_close_session: !cli.keep_open,
        },
    )
    .await
    .with_context(|| format!("failed to bind {}:{}", cli.host, cli.port))?;

    println!("{}", server.uri());
    let handle = server.start();

    tokio::select! {
        _ = handle.closed() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            tracing::info!(target: "kiln.dap", "interrupted; shutting down");
            handle.cancel();
            handle.closed().await;
        }
    }

    Ok(())
}
