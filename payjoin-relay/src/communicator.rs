//! Sender-side relay transport.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::psbt::Psbt;
use futures::StreamExt;
use payjoin_lib::communicator::{parse_proposal_response, with_cancellation};
use payjoin_lib::{ClientParameters, PayjoinError, PayjoinServerCommunicator};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::client::{RelayClient, RelayConnector};
use crate::config::RelayConfig;
use crate::endpoint::{RelayEndpoint, SCHEME};
use crate::event::{EventBuilder, Filter, KIND_ENCRYPTED_DM};
use crate::keys::Keys;
use crate::{nip04, RelayError};

/// Plaintext of a relay payjoin request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPayjoinRequest {
    /// Base64 original PSBT.
    pub psbt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ClientParameters>,
}

/// Sends payjoin requests as encrypted direct messages.
pub struct RelayCommunicator {
    connector: Arc<dyn RelayConnector>,
    config: RelayConfig,
}

impl RelayCommunicator {
    pub fn new(connector: Arc<dyn RelayConnector>, config: RelayConfig) -> Self {
        Self { connector, config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Configured relays followed by the endpoint's own.
    fn relays_for(&self, endpoint: &RelayEndpoint) -> Vec<Url> {
        let mut relays = self.config.relays.clone();
        for relay in &endpoint.relays {
            if !relays.contains(relay) {
                relays.push(relay.clone());
            }
        }
        relays
    }

    async fn exchange(
        &self,
        client: &dyn RelayClient,
        target: &RelayEndpoint,
        original_psbt: &Psbt,
        params: &ClientParameters,
    ) -> Result<String, RelayError> {
        client.connect().await?;

        let keys = Keys::generate();
        let request = RelayPayjoinRequest {
            psbt: original_psbt.to_string(),
            parameters: Some(params.clone()),
        };
        let content = nip04::encrypt(
            &keys.secret_key(),
            &target.public_key,
            &serde_json::to_string(&request)?,
        )?;
        let event = EventBuilder::new(KIND_ENCRYPTED_DM, content)
            .tag("p", target.identifier())
            .sign(&keys);

        let filter = Filter::new()
            .kind(KIND_ENCRYPTED_DM)
            .author(target.identifier())
            .event(event.id.clone());
        let mut replies = client.subscribe(vec![filter]).await?;
        client.publish(&event).await?;
        debug!(event_id = %event.id, "payjoin request published");

        // Any relay may inject events. Only a signed reply from the receiver counts.
        let reply = loop {
            let reply = replies.next().await.ok_or(RelayError::Closed)?;
            match reply.verify() {
                Ok(()) if reply.pubkey == target.identifier() => break reply,
                Ok(()) => {
                    warn!(event_id = %reply.id, author = %reply.pubkey, "ignoring reply from another key")
                }
                Err(e) => warn!(event_id = %reply.id, error = %e, "ignoring unverifiable reply"),
            }
        };
        drop(replies);
        Ok(nip04::decrypt(
            &keys.secret_key(),
            &target.public_key,
            &reply.content,
        )?)
    }
}

#[async_trait]
impl PayjoinServerCommunicator for RelayCommunicator {
    fn supports(&self, endpoint: &Url) -> bool {
        endpoint.scheme() == SCHEME
    }

    #[instrument(skip_all, fields(endpoint = %endpoint))]
    async fn request_payjoin(
        &self,
        endpoint: &Url,
        original_psbt: &Psbt,
        params: &ClientParameters,
        cancel: &CancellationToken,
    ) -> payjoin_lib::Result<Psbt> {
        let target = RelayEndpoint::parse(endpoint)?;
        if target.is_expired_at(crate::unix_now()) {
            return Err(PayjoinError::Precondition(
                "the payjoin endpoint has expired".to_string(),
            ));
        }

        let client = self.connector.open(&self.relays_for(&target)).await?;
        let timeout = self.config.response_timeout();
        let exchange = async {
            match tokio::time::timeout(
                timeout,
                self.exchange(client.as_ref(), &target, original_psbt, params),
            )
            .await
            {
                Ok(result) => result.map_err(PayjoinError::from),
                Err(_) => Err(PayjoinError::ConnectionTimeout {
                    operation: "relay payjoin reply".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        };
        let result = with_cancellation(cancel, exchange).await;

        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "relay disconnect failed");
        }
        parse_proposal_response(&result?)
    }
}
