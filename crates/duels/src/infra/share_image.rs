use log::warn;
use reqwest_middleware::ClientWithMiddleware;

use crate::domain::Duel;

/// Client for the share-image rendering service. Calls are a best-effort
/// side effect of duel creation; failures are the caller's to log.
#[derive(Clone)]
pub struct ShareImageClient {
    client: ClientWithMiddleware,
    base_url: String,
}

impl ShareImageClient {
    pub fn new(client: ClientWithMiddleware, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn request_duel_image(&self, duel: &Duel) -> Result<(), anyhow::Error> {
        let url = format!("{}duel", self.base_url);

        let response = self.client.post(&url).json(duel).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("share image service returned {}: {}", status, body);
            anyhow::bail!("share image request failed with status {}", status);
        }

        Ok(())
    }
}
