use crate::config::RunnersConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use stepgraph_core::{RunnerRegistry, StepAction, StepOutput, StepRequest, StepRunner};
use tokio_util::sync::CancellationToken;

/// Stand-in runner: waits a fixed latency and reports the goal back
pub struct SimulatedRunner {
    latency: Duration,
}

impl SimulatedRunner {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl StepRunner for SimulatedRunner {
    async fn run(&self, request: StepRequest, cancel: CancellationToken) -> Result<StepOutput> {
        tokio::select! {
            _ = cancel.cancelled() => bail!("Step {} cancelled", request.step_number),
            _ = tokio::time::sleep(self.latency) => {}
        }

        tracing::debug!(
            "Simulated {} for step {} of project {}",
            request.action,
            request.step_number,
            request.project_id
        );

        Ok(StepOutput {
            output: Some(format!("Simulated {}: {}", request.action, request.goal)),
        })
    }
}

/// Posts the step request as JSON to an external service.
///
/// A 2xx response may carry `{"output": "..."}`; anything else is a failed
/// attempt.
pub struct WebhookRunner {
    client: reqwest::Client,
    url: String,
}

impl WebhookRunner {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl StepRunner for WebhookRunner {
    async fn run(&self, request: StepRequest, cancel: CancellationToken) -> Result<StepOutput> {
        let step_number = request.step_number;
        let call = async {
            let response = self
                .client
                .post(&self.url)
                .json(&request)
                .send()
                .await
                .with_context(|| format!("Failed to call runner webhook {}", self.url))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                bail!("Runner webhook returned {}: {}", status, body.trim());
            }

            let bytes = response
                .bytes()
                .await
                .context("Failed to read runner webhook response")?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(StepOutput::default());
            }
            serde_json::from_slice(&bytes).context("Failed to parse runner webhook response")
        };

        tokio::select! {
            _ = cancel.cancelled() => bail!("Step {} cancelled", step_number),
            result = call => result,
        }
    }
}

/// Webhook runners where configured, the simulated runner everywhere else
pub fn build_registry(config: &RunnersConfig) -> Result<RunnerRegistry> {
    let simulated: Arc<dyn StepRunner> =
        Arc::new(SimulatedRunner::new(Duration::from_millis(config.simulated_latency_ms)));
    let mut registry = RunnerRegistry::with_default(simulated);

    if config.webhooks.is_empty() && config.agents.is_empty() {
        tracing::info!("No runner webhooks configured, all steps use the simulated runner");
        return Ok(registry);
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.webhook_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    for action in StepAction::ALL {
        if let Some(url) = config.webhooks.get(&action) {
            tracing::info!("Steps with action {} run through {}", action, url);
            registry.register_action(action, Arc::new(WebhookRunner::new(client.clone(), url.clone())));
        }
    }
    for (agent, url) in &config.agents {
        tracing::info!("Steps for agent {} run through {}", agent, url);
        registry.register_agent(agent.clone(), Arc::new(WebhookRunner::new(client.clone(), url.clone())));
    }

    Ok(registry)
}
