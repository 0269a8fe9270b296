//! Direct-transport adapter for the receiver pipeline.
//!
//! Maps an HTTP request (query string and body) to a pipeline run and the
//! run's outcome to a status code and body. Serving HTTP is left to the
//! embedding application.

use std::str::FromStr;

use bitcoin::psbt::Psbt;
use tracing::warn;

use super::{PayjoinReceiver, PayjoinReceiverWallet, ProposalContext};
use crate::errors::ReceiverError;
use crate::params::ClientParameters;

/// Run the pipeline for one direct-transport request.
///
/// Returns `(200, proposal)` on success, `(400, error JSON)` when the
/// pipeline refuses the original PSBT and `(500, unknown-error JSON)` when
/// no proposal came out of a successful run.
pub async fn handle_http_request<W: PayjoinReceiverWallet>(
    receiver: &PayjoinReceiver<W>,
    query: &str,
    body: &str,
) -> (u16, String) {
    let query = query.trim_start_matches('?');
    let params = match ClientParameters::from_query(query) {
        Ok(_) if query.is_empty() => None,
        Ok(params) => Some(params),
        Err(e) => {
            let err = ReceiverError::original_psbt_rejected(e.to_string());
            return (400, err.to_json());
        }
    };
    let original = match Psbt::from_str(body.trim()) {
        Ok(psbt) => psbt,
        Err(e) => {
            let err = ReceiverError::original_psbt_rejected(format!("invalid PSBT: {}", e));
            return (400, err.to_json());
        }
    };

    let mut ctx = ProposalContext::new(original, params);
    if let Err(err) = receiver.initiate(&mut ctx).await {
        return (400, err.to_json());
    }

    match ctx.proposal() {
        Some(proposal) => (200, proposal.payjoin_psbt.to_string()),
        None => {
            warn!("pipeline succeeded without a proposal");
            (500, ReceiverError::unknown("no proposal").to_json())
        }
    }
}
