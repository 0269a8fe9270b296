//! Optional sender parameters (`v`, `additionalfeeoutputindex`, ...).
//!
//! The same [`ClientParameters`] travel as URL query parameters over HTTP and
//! as a camelCase JSON object inside relay messages.

use bitcoin::{Amount, FeeRate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only protocol version this crate speaks.
pub const PAYJOIN_VERSION: u32 = 1;

const KWU_PER_SAT_VB: f64 = 250.0;

/// Error parsing parameters from a query string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    /// A known key carried an unparseable value.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Query key
        key: &'static str,
        /// Offending value
        value: String,
    },
}

/// Parameters the sender attaches to its original PSBT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientParameters {
    /// Protocol version, must be 1.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Upper bound on what the receiver may take from the fee output.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "amount_sat")]
    pub max_additional_fee_contribution: Option<Amount>,

    /// Minimum fee rate the final transaction must pay.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "fee_rate_sat_vb")]
    pub min_fee_rate: Option<FeeRate>,

    /// Index of the sender output that may absorb additional fee.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_fee_output_index: Option<usize>,

    /// Forbid the receiver from substituting the payment output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_output_substitution: Option<bool>,
}

fn default_version() -> u32 {
    PAYJOIN_VERSION
}

impl Default for ClientParameters {
    fn default() -> Self {
        Self {
            version: PAYJOIN_VERSION,
            max_additional_fee_contribution: None,
            min_fee_rate: None,
            additional_fee_output_index: None,
            disable_output_substitution: None,
        }
    }
}

impl ClientParameters {
    /// Parameters a receiver assumes when the sender supplied none.
    pub fn receiver_defaults() -> Self {
        Self {
            max_additional_fee_contribution: Some(Amount::ZERO),
            disable_output_substitution: Some(false),
            ..Self::default()
        }
    }

    /// Whether the receiver may substitute the payment output.
    pub fn output_substitution_allowed(&self) -> bool {
        self.disable_output_substitution != Some(true)
    }

    /// Encode as ordered query pairs.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("v", self.version.to_string())];
        if let Some(index) = self.additional_fee_output_index {
            pairs.push(("additionalfeeoutputindex", index.to_string()));
        }
        if let Some(disable) = self.disable_output_substitution {
            pairs.push(("disableoutputsubstitution", disable.to_string()));
        }
        if let Some(max) = self.max_additional_fee_contribution {
            pairs.push(("maxadditionalfeecontribution", max.to_sat().to_string()));
        }
        if let Some(rate) = self.min_fee_rate {
            pairs.push(("minfeerate", format_sat_per_vb(rate)));
        }
        pairs
    }

    /// Encode as a query string (without the leading `?`).
    pub fn to_query_string(&self) -> String {
        self.to_query_pairs()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(&value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Parse from a query string. Unknown keys are ignored; `v` defaults to 1.
    pub fn from_query(query: &str) -> Result<Self, ParamsError> {
        let mut params = Self::default();

        for pair in query.trim_start_matches('?').split('&') {
            if pair.is_empty() {
                continue;
            }
            let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
            let value = urlencoding::decode(raw)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| raw.to_string());

            match key {
                "v" => params.version = parse_value("v", &value)?,
                "additionalfeeoutputindex" => {
                    params.additional_fee_output_index =
                        Some(parse_value("additionalfeeoutputindex", &value)?)
                }
                "disableoutputsubstitution" => {
                    params.disable_output_substitution =
                        Some(parse_value("disableoutputsubstitution", &value)?)
                }
                "maxadditionalfeecontribution" => {
                    let sats: u64 = parse_value("maxadditionalfeecontribution", &value)?;
                    params.max_additional_fee_contribution = Some(Amount::from_sat(sats));
                }
                "minfeerate" => {
                    params.min_fee_rate = Some(
                        parse_sat_per_vb(&value).ok_or_else(|| ParamsError::InvalidValue {
                            key: "minfeerate",
                            value: value.clone(),
                        })?,
                    )
                }
                _ => {}
            }
        }

        Ok(params)
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ParamsError> {
    value.parse().map_err(|_| ParamsError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

/// Fee rate as a decimal sat/vB string.
pub fn format_sat_per_vb(rate: FeeRate) -> String {
    (rate.to_sat_per_kwu() as f64 / KWU_PER_SAT_VB).to_string()
}

/// Parse a decimal sat/vB value.
pub fn parse_sat_per_vb(value: &str) -> Option<FeeRate> {
    let sat_vb: f64 = value.trim().parse().ok()?;
    fee_rate_from_sat_per_vb(sat_vb)
}

pub(crate) fn fee_rate_from_sat_per_vb(sat_vb: f64) -> Option<FeeRate> {
    if !sat_vb.is_finite() || sat_vb < 0.0 {
        return None;
    }
    Some(FeeRate::from_sat_per_kwu((sat_vb * KWU_PER_SAT_VB).round() as u64))
}

mod amount_sat {
    use bitcoin::Amount;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Amount>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(amount) => s.serialize_u64(amount.to_sat()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Amount>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Amount::from_sat))
    }
}

mod fee_rate_sat_vb {
    use bitcoin::FeeRate;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<FeeRate>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(rate) => s.serialize_f64(rate.to_sat_per_kwu() as f64 / super::KWU_PER_SAT_VB),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<FeeRate>, D::Error> {
        match Option::<f64>::deserialize(d)? {
            Some(sat_vb) => super::fee_rate_from_sat_per_vb(sat_vb)
                .map(Some)
                .ok_or_else(|| de::Error::custom("fee rate must be a non-negative number")),
            None => Ok(None),
        }
    }
}
