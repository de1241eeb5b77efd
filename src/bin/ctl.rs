//! CLI client for the LocalCan control API
//!
//! Usage:
//!   localcan-ctl domains list
//!   localcan-ctl domains add <domain> <target> [--ssl]
//!   localcan-ctl domains toggle <id>
//!   localcan-ctl certs generate <domain>
//!   localcan-ctl proxy start [--port <port>]
//!   localcan-ctl service install

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};

/// Control a running LocalCan daemon
#[derive(Parser, Debug)]
#[command(name = "localcan-ctl")]
#[command(author = "LocalCan Contributors")]
#[command(version)]
#[command(about = "Manage domains, certificates, the proxy and the service of a LocalCan daemon")]
struct Args {
    /// Control API base URL
    #[arg(long, env = "LOCALCAN_API", default_value = "http://127.0.0.1:7878")]
    api: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Custom and detected domains
    #[command(subcommand)]
    Domains(DomainCommand),

    /// Leaf certificates and the root CA
    #[command(subcommand)]
    Certs(CertCommand),

    /// Reverse proxy listener
    #[command(subcommand)]
    Proxy(ProxyCommand),

    /// Background OS service
    #[command(subcommand)]
    Service(ServiceCommand),

    /// Detected development servers
    #[command(subcommand)]
    Processes(ProcessCommand),

    /// Check write access to the hosts file
    Hosts,
}

#[derive(Subcommand, Debug)]
enum DomainCommand {
    /// List all domains
    List,

    /// Add a custom domain
    Add {
        /// Domain name (e.g., myapp.local)
        domain: String,

        /// Target URL (e.g., http://localhost:3000)
        target: String,

        /// Serve over https once a certificate exists
        #[arg(long)]
        ssl: bool,
    },

    /// Publish or unpublish a custom domain
    Toggle { id: String },

    /// Change the SSL preference of a custom domain
    Ssl {
        id: String,

        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },

    /// Delete a custom domain
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum CertCommand {
    /// List certificates
    List,

    /// Issue a certificate for a domain
    Generate { domain: String },

    /// Delete a certificate
    Delete { domain: String },

    /// Root CA status
    Ca,

    /// Install the root CA into the system trust store
    InstallCa,
}

#[derive(Subcommand, Debug)]
enum ProxyCommand {
    Status,

    Start {
        /// Port to listen on (defaults to the daemon's HTTP port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    Stop,
}

#[derive(Subcommand, Debug)]
enum ServiceCommand {
    Status,
    Logs,
    Refresh,
    Install,
    Uninstall,
    Start,
    Stop,
}

#[derive(Subcommand, Debug)]
enum ProcessCommand {
    List,
    Refresh,
}

struct ApiClient {
    base: String,
    http: Client,
}

impl ApiClient {
    fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("cannot reach LocalCan at {}", self.base))?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let value: Value = response.json().await.context("invalid response from daemon")?;
        if !status.is_success() {
            let message = value["message"].as_str().unwrap_or("request failed");
            bail!("{} ({})", message, status);
        }
        Ok(value)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.call(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.call(Method::POST, path, body).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        self.call(Method::DELETE, path, None).await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let api = ApiClient::new(&args.api);

    let value = match args.command {
        Commands::Domains(cmd) => match cmd {
            DomainCommand::List => {
                let domains = api.get("/api/domains").await?;
                if !args.json {
                    print_domains(&domains);
                    return Ok(());
                }
                domains
            }
            DomainCommand::Add { domain, target, ssl } => {
                let added = api
                    .post("/api/domains", Some(json!({ "domain": domain, "target": target, "ssl": ssl })))
                    .await?;
                if !args.json {
                    println!("Added domain:");
                    println!("  ID:      {}", added["domain"]["id"].as_str().unwrap_or("-"));
                    println!("  Domain:  {}", added["domain"]["domain"].as_str().unwrap_or("-"));
                    println!("  Target:  {}", added["domain"]["target"].as_str().unwrap_or("-"));
                    println!("  Hosts:   {}", added["hosts"]["status"].as_str().unwrap_or("-"));
                    if let Some(reason) = added["hosts"]["reason"].as_str() {
                        println!("           {}", reason);
                    }
                    return Ok(());
                }
                added
            }
            DomainCommand::Toggle { id } => api.post(&format!("/api/domains/{id}/toggle"), None).await?,
            DomainCommand::Ssl { id, enabled } => {
                api.post(&format!("/api/domains/{id}/ssl"), Some(json!({ "ssl": enabled })))
                    .await?
            }
            DomainCommand::Delete { id } => {
                api.delete(&format!("/api/domains/{id}")).await?;
                println!("Deleted domain {}", id);
                return Ok(());
            }
        },

        Commands::Certs(cmd) => match cmd {
            CertCommand::List => {
                let certs = api.get("/api/certificates").await?;
                if !args.json {
                    print_certificates(&certs);
                    return Ok(());
                }
                certs
            }
            CertCommand::Generate { domain } => {
                api.post("/api/certificates", Some(json!({ "domain": domain }))).await?
            }
            CertCommand::Delete { domain } => {
                api.delete(&format!("/api/certificates/{domain}")).await?;
                println!("Deleted certificate for {}", domain);
                return Ok(());
            }
            CertCommand::Ca => api.get("/api/ca").await?,
            CertCommand::InstallCa => api.post("/api/ca/install", None).await?,
        },

        Commands::Proxy(cmd) => match cmd {
            ProxyCommand::Status => api.get("/api/proxy").await?,
            ProxyCommand::Start { port } => api.post("/api/proxy/start", Some(json!({ "port": port }))).await?,
            ProxyCommand::Stop => api.post("/api/proxy/stop", None).await?,
        },

        Commands::Service(cmd) => {
            let value = match cmd {
                ServiceCommand::Status => api.get("/api/service").await?,
                ServiceCommand::Logs => {
                    let logs = api.get("/api/service/logs").await?;
                    if !args.json {
                        for line in logs.as_array().into_iter().flatten() {
                            println!("{}", line.as_str().unwrap_or_default());
                        }
                        return Ok(());
                    }
                    logs
                }
                ServiceCommand::Refresh => api.post("/api/service/refresh", None).await?,
                ServiceCommand::Install => api.post("/api/service/install", None).await?,
                ServiceCommand::Uninstall => api.post("/api/service/uninstall", None).await?,
                ServiceCommand::Start => api.post("/api/service/start", None).await?,
                ServiceCommand::Stop => api.post("/api/service/stop", None).await?,
            };

            if let Some(script) = value["script_path"].as_str() {
                if !args.json {
                    println!("Script created at: {}", script);
                    println!("Run it with administrator privileges to finish, then `localcan-ctl service refresh`.");
                    return Ok(());
                }
            }
            value
        }

        Commands::Processes(cmd) => match cmd {
            ProcessCommand::List => api.get("/api/processes").await?,
            ProcessCommand::Refresh => api.post("/api/processes/refresh", None).await?,
        },

        Commands::Hosts => api.get("/api/hosts/permission").await?,
    };

    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_domains(domains: &Value) {
    let rows = domains.as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        println!("No domains found");
        return;
    }

    println!(
        "{:<36} {:<30} {:<6} {:<30} {:<10}",
        "ID", "DOMAIN", "PROTO", "TARGET", "PUBLISHED"
    );
    println!("{}", "-".repeat(116));

    for row in &rows {
        let source = &row["source"];
        let id = match source["kind"].as_str() {
            Some("custom") => source["id"].as_str().unwrap_or("-").to_string(),
            _ => format!("({})", source["framework"].as_str().unwrap_or("detected")),
        };
        println!(
            "{:<36} {:<30} {:<6} {:<30} {:<10}",
            id,
            row["domain"].as_str().unwrap_or("-"),
            row["protocol"].as_str().unwrap_or("-"),
            row["local_target"].as_str().unwrap_or("-"),
            row["published"].as_bool().unwrap_or(false),
        );
    }

    println!("\nTotal: {} domain(s)", rows.len());
}

fn print_certificates(certs: &Value) {
    let rows = certs.as_array().cloned().unwrap_or_default();
    if rows.is_empty() {
        println!("No certificates found");
        return;
    }

    println!("{:<40} {:<16} {:<26} {:<6}", "DOMAIN", "KIND", "EXPIRES", "VALID");
    println!("{}", "-".repeat(91));

    for row in &rows {
        println!(
            "{:<40} {:<16} {:<26} {:<6}",
            row["domain"].as_str().unwrap_or("-"),
            row["kind"].as_str().unwrap_or("-"),
            row["expires_at"].as_str().unwrap_or("-"),
            row["is_valid"].as_bool().unwrap_or(false),
        );
    }
}
