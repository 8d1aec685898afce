use clap::{Parser, Subcommand};
use kube::api::GroupVersionKind;
use kube::client::Client;
use owo_colors::OwoColorize;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

mod leases;
mod namespaces;
mod util;

#[cfg(feature = "metrics")]
mod metrics;

/// Top-level CLI configuration for the binary. Any command line
/// flags should go in here. Every flag has an environment fallback so the
/// operator can be configured entirely from a pod spec.
#[derive(Parser)]
#[command(author, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// API group of the managed resource. Empty selects the core group.
    #[arg(long, env = "GROUP", default_value = "")]
    group: String,

    /// API version of the managed resource, e.g. `v1`.
    #[arg(long, env = "VERSION")]
    version: String,

    /// Kind of the managed resource, e.g. `ConfigMap`.
    #[arg(long, env = "KIND")]
    kind: String,

    /// Namespace opt-in label key. Without the pair, every namespace is
    /// managed.
    #[arg(long, env = "OPT_IN_LABEL_KEY", requires = "opt_in_label_value")]
    opt_in_label_key: Option<String>,

    /// Namespace opt-in label value.
    #[arg(long, env = "OPT_IN_LABEL_VALUE", requires = "opt_in_label_key")]
    opt_in_label_value: Option<String>,

    /// Number of concurrent reconcile workers.
    #[arg(long, env = "WORKERS", default_value_t = 2)]
    workers: u16,

    /// Run behind a leader-election lease instead of reconciling
    /// unconditionally.
    #[arg(long, env = "LEADER_ELECT", default_value_t = false)]
    leader_elect: bool,

    /// Log every non-trivial reconcile action to stdout.
    #[arg(long, env = "VERBOSE", default_value_t = false)]
    verbose: bool,

    /// Prometheus metrics server scrape port. Disabled by default.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

/// List of subcommands for the binary. Clap will convert the
/// name of each enum variant to kebab-case for the CLI.
#[derive(Subcommand)]
enum Command {
    ManageLeases,
}

/// Secondary entrypoint that resolves the managed GVK and runs the
/// appropriate subcommand.
async fn run(client: Client) {
    let cli = Cli::parse();

    let gvk = GroupVersionKind::gvk(&cli.group, &cli.version, &cli.kind);
    let (resource, _capabilities) = match kube::discovery::pinned_kind(&client, &gvk).await {
        Ok(found) => found,
        Err(e) => {
            eprintln!(
                "{}",
                format!(
                    "{} {}/{} is not served by this cluster: {e}",
                    cli.kind, cli.group, cli.version
                )
                .red()
            );
            std::process::exit(1);
        }
    };

    // Flipped once the watch cache finishes its initial sync.
    let ready = Arc::new(AtomicBool::new(false));

    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = cli.metrics_port {
        tokio::spawn(metrics::run_server(
            metrics_port,
            metrics::HealthState {
                client: client.clone(),
                resource: resource.clone(),
                ready: ready.clone(),
            },
        ));
    }

    let settings = leases::Settings {
        resource,
        gvk,
        opt_in: cli
            .opt_in_label_key
            .zip(cli.opt_in_label_value)
            .map(|(key, value)| namespaces::OptInLabel { key, value }),
        leader_elect: cli.leader_elect,
        workers: cli.workers.max(1),
        verbose: cli.verbose,
        ready,
    };

    match cli.command {
        Command::ManageLeases => leases::run(client, settings).await,
    }
    .unwrap();

    println!("{}", "🛑 Lease controller stopped.".red());
}

/// Main entrypoint that sets up the environment before running the secondary entrypoint `run`.
#[tokio::main]
async fn main() {
    lapse_common::init();

    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the metrics server or controller may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a kubernetes client using the default configuration.
    // In-cluster, the kubeconfig will be set by the service account.
    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    // Run the secondary entrypoint.
    run(client).await;
}
