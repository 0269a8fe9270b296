//! PSBT inspection

use anyhow::Result;
use bitcoin::psbt::Psbt;
use payjoin_lib::params::format_sat_per_vb;
use payjoin_lib::psbt::is_finalized;
use payjoin_lib::PsbtExt;
use serde::Serialize;

use crate::ui;

#[derive(Debug, Serialize)]
pub struct InputSummary {
    pub outpoint: String,
    pub value_sat: Option<u64>,
    pub script_type: Option<String>,
    pub finalized: bool,
}

#[derive(Debug, Serialize)]
pub struct OutputSummary {
    pub value_sat: u64,
    pub script_pubkey: String,
    pub has_key_origin: bool,
}

#[derive(Debug, Serialize)]
pub struct PsbtSummary {
    pub txid: String,
    pub inputs: Vec<InputSummary>,
    pub outputs: Vec<OutputSummary>,
    pub fee_sat: Option<u64>,
    pub estimated_vsize: Option<u64>,
    pub fee_rate_sat_per_vb: Option<String>,
    pub global_xpubs: usize,
    pub issues: Vec<String>,
}

pub fn summarize(psbt: &Psbt) -> PsbtSummary {
    let inputs = psbt
        .unsigned_tx
        .input
        .iter()
        .enumerate()
        .map(|(i, txin)| InputSummary {
            outpoint: txin.previous_output.to_string(),
            value_sat: psbt.spent_output(i).map(|out| out.value.to_sat()),
            script_type: psbt.input_script_type(i).map(|t| t.to_string()),
            finalized: psbt.inputs.get(i).is_some_and(is_finalized),
        })
        .collect();

    let outputs = psbt
        .unsigned_tx
        .output
        .iter()
        .enumerate()
        .map(|(i, out)| OutputSummary {
            value_sat: out.value.to_sat(),
            script_pubkey: out.script_pubkey.to_hex_string(),
            has_key_origin: psbt.outputs.get(i).is_some_and(|o| {
                !o.bip32_derivation.is_empty() || !o.tap_key_origins.is_empty()
            }),
        })
        .collect();

    PsbtSummary {
        txid: psbt.unsigned_tx.compute_txid().to_string(),
        inputs,
        outputs,
        fee_sat: psbt.fee_amount().map(|fee| fee.to_sat()),
        estimated_vsize: psbt.estimated_vsize(),
        fee_rate_sat_per_vb: psbt.estimated_fee_rate().map(format_sat_per_vb),
        global_xpubs: psbt.xpub.len(),
        issues: psbt.sanity_errors().iter().map(|e| e.to_string()).collect(),
    }
}

pub fn run(psbt: &str, json: bool, verbose: bool) -> Result<()> {
    let psbt = super::read_psbt(psbt)?;
    let summary = summarize(&psbt);

    if json {
        return ui::json(&summary);
    }

    ui::header("PSBT");
    ui::field("Txid", &summary.txid);
    match summary.fee_sat {
        Some(fee) => ui::field("Fee", ui::sats(fee)),
        None => ui::field("Fee", "unknown (missing UTXO data)"),
    }
    if let Some(rate) = &summary.fee_rate_sat_per_vb {
        ui::field("Fee rate", format!("{} sat/vB", rate));
    }
    if verbose {
        if let Some(vsize) = summary.estimated_vsize {
            ui::field("Estimated vsize", format!("{} vB", vsize));
        }
        ui::field("Global xpubs", summary.global_xpubs);
    }

    ui::header(&format!("Inputs ({})", summary.inputs.len()));
    for input in &summary.inputs {
        let value = input.value_sat.map_or_else(|| "?".to_string(), ui::sats);
        let kind = input.script_type.as_deref().unwrap_or("unknown type");
        let state = if input.finalized { "finalized" } else { "unsigned" };
        ui::field(&input.outpoint, format!("{}, {}, {}", value, kind, state));
    }

    ui::header(&format!("Outputs ({})", summary.outputs.len()));
    for (i, output) in summary.outputs.iter().enumerate() {
        let owner = if output.has_key_origin { " (ours)" } else { "" };
        ui::field(
            &format!("#{}", i),
            format!("{} to {}{}", ui::sats(output.value_sat), output.script_pubkey, owner),
        );
    }

    ui::separator();
    if summary.issues.is_empty() {
        ui::success("No structural issues");
    }
    for issue in &summary.issues {
        ui::warning(issue);
    }
    Ok(())
}
