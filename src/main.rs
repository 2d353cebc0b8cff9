/*
 * Copyright (C) 2024 The OpenAPP Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use clap::Parser;
use openapp::openapp::config::ControllerSettings;
use openapp::openapp::controller::registry::GitRegistrySource;
use openapp::openapp::controller::runtime::ControllerRuntime;
use openapp::openapp::k8s::Cluster;
use openapp::openapp::logger::{log_error, log_info, set_log_format, LogFormat};
use openapp::openapp::observability::{health::HealthRegistry, server, tracing};
use openapp::openapp::util::error::{BoxError, ResultExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "main";

#[derive(Parser)]
#[command(name = "openapp-controller")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Args {
    /// Directory holding the registry checkouts.
    #[arg(long, value_name = "PATH")]
    registry_cache: Option<PathBuf>,

    /// Namespace watched for instances and their derived objects.
    #[arg(long)]
    instance_namespace: Option<String>,

    /// Address used for local service URLs instead of interface discovery.
    #[arg(long)]
    node_address: Option<String>,

    /// Period of the registry refresh and template sync timers.
    #[arg(long, value_parser = humantime::parse_duration)]
    sync_interval: Option<Duration>,

    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Bind address of the metrics and health endpoints.
    #[arg(long, env = "OPENAPP_METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,
}

impl Args {
    fn settings(self) -> Result<ControllerSettings, BoxError> {
        let mut settings = ControllerSettings::from_env()?;
        if let Some(path) = self.registry_cache {
            settings.registry_root = path;
        }
        if let Some(namespace) = self.instance_namespace {
            settings.instance_namespace = namespace;
        }
        if let Some(address) = self.node_address {
            settings.node_address = Some(address);
        }
        if let Some(interval) = self.sync_interval.filter(|interval| !interval.is_zero()) {
            settings.sync_interval = interval;
        }
        if let Some(format) = self.log_format {
            settings.log_format = format;
        }
        Ok(settings)
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => {
                let error_text = err.to_string();
                log_error(
                    COMPONENT,
                    "Failed to install SIGTERM handler",
                    &[("error", error_text.as_str())],
                );
            }
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

async fn run(args: Args) -> Result<(), BoxError> {
    let metrics_addr = args.metrics_addr;
    let settings = Arc::new(args.settings()?);
    set_log_format(settings.log_format);

    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;
    let cluster = Cluster::from_client(client);
    let health = HealthRegistry::new();
    let token = CancellationToken::new();

    let server_token = token.clone();
    let server_health = health.clone();
    let server = tokio::spawn(async move {
        if let Err(err) = server::serve(metrics_addr, server_health, server_token).await {
            let error_text = err.to_string();
            log_error(
                COMPONENT,
                "Observability server stopped",
                &[("error", error_text.as_str())],
            );
        }
    });

    let registry_root = settings.registry_root.display().to_string();
    log_info(
        COMPONENT,
        "Starting controllers",
        &[
            ("namespace", settings.instance_namespace.as_str()),
            ("registry_cache", registry_root.as_str()),
        ],
    );
    let runtime = ControllerRuntime::new(
        cluster,
        Arc::clone(&settings),
        Arc::new(GitRegistrySource),
        health,
    );
    let controllers = tokio::select! {
        controllers = runtime.start(token.clone()) => controllers,
        _ = shutdown_signal() => {
            token.cancel();
            let _ = server.await;
            return Ok(());
        }
    };

    shutdown_signal().await;
    log_info(COMPONENT, "Shutdown requested", &[]);
    controllers.shutdown().await;
    let _ = server.await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing::init();
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let error_text = err.to_string();
            log_error(COMPONENT, "Controller exited", &[("error", error_text.as_str())]);
            ExitCode::FAILURE
        }
    }
}
