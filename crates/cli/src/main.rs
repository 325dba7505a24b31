use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use sfkit_core::ResourceStore;
use sfkit_kubehub::{cluster_endpoint, get_kube_client, is_openshift, ClusterEndpoint, KubeStore};
use sfkit_ops::{
    deploy_nodepool, execute, gerrit_plan, gerrit_teardown_targets, nodepool::config_template, teardown, wipe_nodepool,
    GerritConfig, HostAlias, NodepoolConfig, NodepoolDeployReport, PlanReport, StepOutcome, TeardownOutcome, TeardownReport,
};
use sfkit_store::MemoryStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "sfkitctl", version, about = "Provision and tear down a Gerrit stack on Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace of the deployment
    #[arg(long = "ns", global = true, env = "SFKIT_NAMESPACE", default_value = "sf")]
    namespace: String,

    /// Kubeconfig context (default: current context)
    #[arg(long = "context", global = true, env = "SFKIT_KUBE_CONTEXT")]
    context: Option<String>,

    /// Run against an in-memory store that converges on its own
    #[arg(long = "dry-run", global = true, action = ArgAction::SetTrue)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Gerrit code-review server
    Gerrit {
        #[command(subcommand)]
        action: GerritCmd,
    },
    /// Namespace for Nodepool's openshiftpods driver
    Nodepool {
        #[command(subcommand)]
        action: NodepoolCmd,
    },
}

#[derive(Args, Debug, Clone, Copy)]
struct Platform {
    /// Expose Gerrit through an OpenShift Route (default: auto-detect)
    #[arg(long = "openshift", action = ArgAction::SetTrue, conflicts_with = "no_openshift")]
    openshift: bool,
    /// Expose Gerrit through an Ingress (default: auto-detect)
    #[arg(long = "no-openshift", action = ArgAction::SetTrue)]
    no_openshift: bool,
}

impl Platform {
    fn forced(&self) -> Option<bool> {
        match (self.openshift, self.no_openshift) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Subcommand, Debug)]
enum GerritCmd {
    /// Create everything that is missing and wait for Gerrit to come up
    Deploy {
        #[arg(long = "fqdn", env = "SFKIT_FQDN")]
        fqdn: String,
        /// Extra pod host entry, IP=host1,host2 (repeatable)
        #[arg(long = "host-alias")]
        host_aliases: Vec<HostAlias>,
        #[command(flatten)]
        platform: Platform,
    },
    /// Delete the Gerrit objects, Route and Ingress alike; the namespace is kept
    Wipe {
        /// Keep the Gerrit data volume claim
        #[arg(long = "keep-data", action = ArgAction::SetTrue)]
        keep_data: bool,
    },
    /// Print the deploy steps without running them
    Plan {
        #[arg(long = "fqdn", env = "SFKIT_FQDN", default_value = "sftests.com")]
        fqdn: String,
        #[command(flatten)]
        platform: Platform,
    },
}

#[derive(Args, Debug, Clone)]
struct NodepoolTarget {
    /// Namespace Nodepool spawns pods in
    #[arg(long = "nodepool-ns", default_value = "nodepool")]
    nodepool_ns: String,
    /// Kubeconfig context of the cluster Nodepool uses (default: current context)
    #[arg(long = "nodepool-context", env = "SFKIT_NODEPOOL_CONTEXT")]
    nodepool_context: Option<String>,
}

#[derive(Subcommand, Debug)]
enum NodepoolCmd {
    /// Create the namespace, service account and providers secret
    Deploy {
        #[command(flatten)]
        target: NodepoolTarget,
        /// Also print a provider section for nodepool.yaml
        #[arg(long = "show-config-template", action = ArgAction::SetTrue)]
        show_config_template: bool,
        /// Print the kubeconfig instead of storing it in the providers secret
        #[arg(long = "skip-providers-secrets", action = ArgAction::SetTrue)]
        skip_providers_secrets: bool,
    },
    /// Delete the service account, its grants and the providers secret
    Wipe {
        #[command(flatten)]
        target: NodepoolTarget,
    },
}

fn init_tracing() {
    let env = std::env::var("SFKIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("SFKIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid SFKIT_METRICS_ADDR; expected host:port");
        }
    }
}

/// Store the commands run against, plus a live client when there is one.
struct Backend {
    store: Box<dyn ResourceStore>,
    client: Option<kube::Client>,
}

async fn backend(dry_run: bool, context: Option<&str>) -> Result<Backend> {
    if dry_run {
        info!(context = context.unwrap_or("<current>"), "dry run: using in-memory store");
        return Ok(Backend { store: Box::new(MemoryStore::converging()), client: None });
    }
    let client = get_kube_client(context).await.with_context(|| format!("connecting to context {}", context.unwrap_or("<current>")))?;
    Ok(Backend { store: Box::new(KubeStore::new(client.clone())), client: Some(client) })
}

async fn resolve_openshift(platform: Platform, client: Option<&kube::Client>) -> Result<bool> {
    if let Some(forced) = platform.forced() {
        return Ok(forced);
    }
    match client {
        Some(c) => is_openshift(c.clone()).await.context("detecting OpenShift"),
        None => Ok(false),
    }
}

fn endpoint_for(context: Option<&str>, dry_run: bool) -> Result<ClusterEndpoint> {
    match cluster_endpoint(context) {
        Ok(ep) => Ok(ep),
        Err(e) if dry_run => {
            warn!(error = %e, "no usable kubeconfig endpoint; dry run uses the in-cluster address");
            Ok(ClusterEndpoint {
                server: "https://kubernetes.default.svc".into(),
                certificate_authority_data: None,
                insecure_skip_tls_verify: false,
            })
        }
        Err(e) => Err(e),
    }
}

/// Cancelled on Ctrl-C; running plans stop between store calls.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; cancelling");
            trigger.cancel();
        }
    });
    token
}

fn print_plan_report(output: Output, report: &PlanReport) -> Result<()> {
    match output {
        Output::Human => {
            for s in &report.steps {
                let result = match &s.outcome {
                    StepOutcome::Created => "created".to_string(),
                    StepOutcome::AlreadyPresent => "present".to_string(),
                    StepOutcome::Ready { attempts, elapsed_ms } => format!("ready after {} polls ({} ms)", attempts, elapsed_ms),
                };
                println!("{:>3}  {:<60} {}", s.index, s.label, result);
            }
            println!("{}: {} created, {} already present", report.plan, report.created(), report.already_present());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_teardown_report(output: Output, report: &TeardownReport) -> Result<()> {
    match output {
        Output::Human => {
            for e in &report.entries {
                match &e.outcome {
                    TeardownOutcome::Deleted => println!("- {}", e.reference),
                    TeardownOutcome::Absent => println!("  {} (absent)", e.reference),
                    TeardownOutcome::Failed { message } => println!("! {}: {}", e.reference, message),
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_nodepool_report(output: Output, report: &NodepoolDeployReport) -> Result<()> {
    match output {
        Output::Human => {
            print_plan_report(output, &report.namespace)?;
            if let Some(providers) = &report.providers {
                print_plan_report(output, providers)?;
            }
            if let Some(kubeconfig) = &report.kubeconfig {
                println!("Provider kubeconfig:");
                println!("{}", kubeconfig);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

const SUCCESS: u8 = 0;
const FAILURE: u8 = 1;

fn teardown_status(report: &TeardownReport) -> u8 {
    let failed = report.failures().count();
    if failed == 0 {
        SUCCESS
    } else {
        error!(failed, "teardown finished with failures");
        FAILURE
    }
}

/// Process exit status for the result of [`run`].
fn exit_status(result: Result<u8>) -> u8 {
    match result {
        Ok(status) => status,
        Err(e) => {
            error!(error = %format!("{:#}", e), "command failed");
            eprintln!("error: {:#}", e);
            FAILURE
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<u8> {
    match &cli.command {
        Commands::Gerrit { action: GerritCmd::Plan { fqdn, platform } } => {
            let mut cfg = GerritConfig::new(cli.namespace.clone(), fqdn.clone()).with_env_overrides();
            cfg.openshift = platform.forced().unwrap_or(false);
            let steps = gerrit_plan(&cfg)?.describe();
            match cli.output {
                Output::Human => {
                    for s in &steps {
                        match (&s.predicate, s.poll_secs, s.max_attempts) {
                            (Some(p), Some(secs), Some(max)) => {
                                println!("{:>3}  wait   {:<48} {} every {}s, {} attempts", s.index, s.reference.to_string(), p, secs, max)
                            }
                            _ => println!("{:>3}  ensure {}", s.index, s.reference),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&steps)?),
            }
            Ok(SUCCESS)
        }
        Commands::Gerrit { action: GerritCmd::Deploy { fqdn, host_aliases, platform } } => {
            let be = backend(cli.dry_run, cli.context.as_deref()).await?;
            let mut cfg = GerritConfig::new(cli.namespace.clone(), fqdn.clone()).with_env_overrides();
            cfg.openshift = resolve_openshift(*platform, be.client.as_ref()).await?;
            cfg.host_aliases = host_aliases.clone();
            info!(ns = %cfg.namespace, fqdn = %cfg.fqdn, openshift = cfg.openshift, "gerrit deploy invoked");
            let report = execute(be.store.as_ref(), gerrit_plan(&cfg)?, &cancel).await?;
            print_plan_report(cli.output, &report)?;
            Ok(SUCCESS)
        }
        Commands::Gerrit { action: GerritCmd::Wipe { keep_data } } => {
            let be = backend(cli.dry_run, cli.context.as_deref()).await?;
            let cfg = GerritConfig::new(cli.namespace.clone(), String::new());
            info!(ns = %cfg.namespace, keep_data, "gerrit wipe invoked");
            let report = teardown(be.store.as_ref(), &gerrit_teardown_targets(&cfg, *keep_data)).await;
            print_teardown_report(cli.output, &report)?;
            Ok(teardown_status(&report))
        }
        Commands::Nodepool { action: NodepoolCmd::Deploy { target, show_config_template, skip_providers_secrets } } => {
            if target.nodepool_context == cli.context {
                warn!("nodepool will use the same cluster context as the deployment");
                if target.nodepool_ns == cli.namespace {
                    warn!("nodepool will manage resources in the same namespace as the deployment");
                }
            }
            let np_context = target.nodepool_context.as_deref();
            let np = backend(cli.dry_run, np_context).await?;
            let sf = backend(cli.dry_run, cli.context.as_deref()).await?;
            let cfg = NodepoolConfig::new(cli.namespace.clone(), target.nodepool_ns.clone(), endpoint_for(np_context, cli.dry_run)?)
                .with_env_overrides();
            info!(ns = %cfg.sf_namespace, nodepool_ns = %cfg.nodepool_namespace, server = %cfg.endpoint.server, "nodepool deploy invoked");
            let report = deploy_nodepool(np.store.as_ref(), sf.store.as_ref(), &cfg, *skip_providers_secrets, &cancel).await?;
            print_nodepool_report(cli.output, &report)?;
            if *show_config_template {
                println!("Nodepool configuration template:");
                println!("{}", config_template(&target.nodepool_ns)?);
            }
            Ok(SUCCESS)
        }
        Commands::Nodepool { action: NodepoolCmd::Wipe { target } } => {
            let np = backend(cli.dry_run, target.nodepool_context.as_deref()).await?;
            let sf = backend(cli.dry_run, cli.context.as_deref()).await?;
            let placeholder = ClusterEndpoint { server: String::new(), certificate_authority_data: None, insecure_skip_tls_verify: false };
            let cfg = NodepoolConfig::new(cli.namespace.clone(), target.nodepool_ns.clone(), placeholder);
            info!(nodepool_ns = %cfg.nodepool_namespace, "nodepool wipe invoked");
            let report = wipe_nodepool(np.store.as_ref(), sf.store.as_ref(), &cfg).await;
            print_teardown_report(cli.output, &report)?;
            Ok(teardown_status(&report))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    ExitCode::from(exit_status(run(cli, cancel_on_ctrl_c()).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use sfkit_core::{Kind, ResourceRef};
    use sfkit_ops::{ProvisionError, TeardownEntry};

    #[test]
    fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

    #[test]
    fn deploy_parses_host_aliases_and_platform() {
        let cli = Cli::try_parse_from([
            "sfkitctl", "--ns", "demo", "gerrit", "deploy", "--fqdn", "sftests.com",
            "--host-alias", "10.0.0.1=gerrit.sftests.com", "--host-alias", "10.0.0.2=a,b", "--no-openshift",
        ])
        .unwrap();
        assert_eq!(cli.namespace, "demo");
        match cli.command {
            Commands::Gerrit { action: GerritCmd::Deploy { fqdn, host_aliases, platform } } => {
                assert_eq!(fqdn, "sftests.com");
                assert_eq!(host_aliases.len(), 2);
                assert_eq!(host_aliases[1].hostnames, vec!["a", "b"]);
                assert_eq!(platform.forced(), Some(false));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn platform_flags_conflict() {
        let r = Cli::try_parse_from(["sfkitctl", "gerrit", "deploy", "--fqdn", "x", "--openshift", "--no-openshift"]);
        assert!(r.is_err());
    }

    #[test]
    fn wipe_takes_no_platform() {
        assert!(Cli::try_parse_from(["sfkitctl", "gerrit", "wipe", "--openshift"]).is_err());
        assert!(Cli::try_parse_from(["sfkitctl", "gerrit", "wipe", "--keep-data"]).is_ok());
    }

    #[test]
    fn nodepool_deploy_parses_second_cluster() {
        let cli = parse(&[
            "--context", "sf-admin", "nodepool", "deploy", "--nodepool-context", "pods-admin", "--skip-providers-secrets",
        ]);
        match cli.command {
            Commands::Nodepool { action: NodepoolCmd::Deploy { target, skip_providers_secrets, show_config_template } } => {
                assert_eq!(target.nodepool_ns, "nodepool");
                assert_eq!(target.nodepool_context.as_deref(), Some("pods-admin"));
                assert!(skip_providers_secrets);
                assert!(!show_config_template);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    fn parse(args: &[&str]) -> Cli { Cli::try_parse_from(std::iter::once("sfkitctl").chain(args.iter().copied())).unwrap() }

    fn entry(outcome: TeardownOutcome) -> TeardownEntry {
        TeardownEntry { reference: ResourceRef::namespaced(Kind::Secret, "sf", "admin-ssh-key"), outcome }
    }

    #[test]
    fn teardown_failures_map_to_exit_status() {
        let mut report = TeardownReport::default();
        assert_eq!(teardown_status(&report), SUCCESS);
        report.entries.push(entry(TeardownOutcome::Deleted));
        report.entries.push(entry(TeardownOutcome::Absent));
        assert_eq!(teardown_status(&report), SUCCESS);
        report.entries.push(entry(TeardownOutcome::Failed { message: "forbidden".into() }));
        assert_eq!(teardown_status(&report), FAILURE);
    }

    #[test]
    fn errors_map_to_failure() {
        assert_eq!(exit_status(Ok(SUCCESS)), SUCCESS);
        assert_eq!(exit_status(Ok(FAILURE)), FAILURE);
        assert_eq!(exit_status(Err(anyhow::anyhow!("boom"))), FAILURE);
    }

    #[tokio::test]
    async fn dry_run_nodepool_deploy_succeeds() {
        let cli = parse(&["--dry-run", "nodepool", "deploy", "--nodepool-ns", "pods", "--nodepool-context", "pods-admin"]);
        assert_eq!(exit_status(run(cli, CancellationToken::new()).await), SUCCESS);
    }

    #[tokio::test]
    async fn dry_run_wipe_of_nothing_succeeds() {
        let cli = parse(&["--dry-run", "gerrit", "wipe"]);
        assert_eq!(exit_status(run(cli, CancellationToken::new()).await), SUCCESS);
        let cli = parse(&["--dry-run", "nodepool", "wipe"]);
        assert_eq!(exit_status(run(cli, CancellationToken::new()).await), SUCCESS);
    }

    #[tokio::test]
    async fn cancelled_deploy_is_a_provision_error_and_fails() {
        let cli = parse(&["--dry-run", "nodepool", "deploy", "--skip-providers-secrets"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run(cli, cancel).await;
        let err = result.as_ref().unwrap_err().downcast_ref::<ProvisionError>().unwrap();
        assert_eq!(err.index, 1);
        assert_eq!(exit_status(result), FAILURE);
    }

    #[test]
    fn bad_host_alias_is_rejected() {
        let r = Cli::try_parse_from(["sfkitctl", "gerrit", "deploy", "--fqdn", "x", "--host-alias", "not-an-alias"]);
        assert!(r.is_err());
    }
}
