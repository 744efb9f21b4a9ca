//! Precompile verifier — replays the on-chain snapshot check in-process.
//!
//! A snapshot reference is accepted when its Merkle leaf folds to the given
//! root under the sorted-pair keccak256 rule, and the referenced Wasm module
//! then runs to completion inside an instruction budget and a wall-clock
//! deadline. Budget exhaustion and Merkle mismatches are verification
//! failures, not errors.

use std::time::Duration;

use sha3::{Digest, Keccak256};
use tokio_util::sync::CancellationToken;
use wasmtime::{Config, Engine, Linker, Module, Store, Trap, Val};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::WasiCtxBuilder;

use crate::fetch::{FetchError, ModuleFetcher};

/// Fuel budget for one verification run. One unit per executed instruction,
/// as priced by the engine.
pub const INSTRUCTION_BUDGET: u64 = 1000;
/// Wall-clock ceiling on module execution.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Inclusion proof for a snapshot leaf under a root.
#[derive(Debug, Clone, Default)]
pub struct MerkleProof {
    pub leaf: Vec<u8>,
    pub root: Vec<u8>,
    pub path: Vec<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum PrecompileError {
    #[error("missing snapshot cid")]
    MissingCid,
    #[error("missing proof data")]
    MissingProof,
    #[error("fetch snapshot: {0}")]
    Fetch(#[from] FetchError),
    #[error("instantiate module: {0}")]
    Instantiate(#[source] anyhow::Error),
    #[error("execute module: {0}")]
    Execution(#[source] anyhow::Error),
    #[error("execution deadline exceeded")]
    Deadline,
    #[error("runtime setup: {0}")]
    Setup(#[source] anyhow::Error),
}

/// Verify a snapshot reference: Merkle inclusion first, then a budgeted run
/// of the referenced module.
///
/// `Ok(false)` means the snapshot was rejected (bad proof or budget breach);
/// `Err` means verification itself could not be carried out.
pub async fn verify_snapshot(
    cancel: &CancellationToken,
    fetcher: &dyn ModuleFetcher,
    snapshot_cid: &str,
    proof: &MerkleProof,
) -> Result<bool, PrecompileError> {
    if snapshot_cid.is_empty() {
        return Err(PrecompileError::MissingCid);
    }
    if proof.leaf.is_empty() || proof.root.is_empty() {
        return Err(PrecompileError::MissingProof);
    }
    if !verify_merkle(proof) {
        return Ok(false);
    }

    let module = fetcher.fetch_module(snapshot_cid).await?;
    execute_with_budget(cancel, module.to_vec()).await
}

/// Fold the proof path over the leaf with the sorted-pair keccak rule used by
/// the contract.
pub fn verify_merkle(proof: &MerkleProof) -> bool {
    let mut computed = proof.leaf.clone();
    for sibling in &proof.path {
        computed = if computed.as_slice() < sibling.as_slice() {
            keccak_pair(&computed, sibling)
        } else {
            keccak_pair(sibling, &computed)
        };
    }
    computed == proof.root
}

fn keccak_pair(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().to_vec()
}

// ── Budgeted execution ────────────────────────────────────────────────────────

/// Run a module under the fuel budget and wall-clock deadline.
///
/// The deadline and external cancellation are both delivered as an epoch bump
/// so a hot loop inside the guest cannot outlive either.
async fn execute_with_budget(
    cancel: &CancellationToken,
    module: Vec<u8>,
) -> Result<bool, PrecompileError> {
    let mut config = Config::new();
    config.consume_fuel(true);
    config.epoch_interruption(true);
    let engine = Engine::new(&config).map_err(PrecompileError::Setup)?;

    let interrupter = tokio::spawn({
        let engine = engine.clone();
        let cancel = cancel.clone();
        async move {
            tokio::select! {
                _ = tokio::time::sleep(EXEC_TIMEOUT) => {}
                _ = cancel.cancelled() => {}
            }
            engine.increment_epoch();
        }
    });

    let outcome = tokio::task::spawn_blocking({
        let engine = engine.clone();
        move || run_module(&engine, &module)
    })
    .await;
    interrupter.abort();

    match outcome {
        Ok(result) => result,
        Err(err) => Err(PrecompileError::Setup(anyhow::anyhow!(
            "executor thread failed: {err}"
        ))),
    }
}

fn run_module(engine: &Engine, module: &[u8]) -> Result<bool, PrecompileError> {
    let module = Module::new(engine, module).map_err(PrecompileError::Instantiate)?;

    let mut linker: Linker<WasiP1Ctx> = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |ctx| ctx).map_err(PrecompileError::Setup)?;

    let mut store = Store::new(engine, WasiCtxBuilder::new().build_p1());
    store.set_fuel(INSTRUCTION_BUDGET).map_err(PrecompileError::Setup)?;
    store.set_epoch_deadline(1);

    // A start section already executes under the budget here.
    let instance = match linker.instantiate(&mut store, &module) {
        Ok(instance) => instance,
        Err(err) => return classify_trap(err, true),
    };

    let entry = instance
        .get_func(&mut store, "_start")
        .or_else(|| instance.get_func(&mut store, "run"));
    if let Some(func) = entry {
        let mut results = vec![Val::I32(0); func.ty(&store).results().len()];
        if let Err(err) = func.call(&mut store, &[], &mut results) {
            return classify_trap(err, false);
        }
    }

    Ok(true)
}

/// Map a wasmtime error to the verification outcome: out-of-fuel is a plain
/// rejection, an epoch interrupt is the deadline, everything else surfaces.
fn classify_trap(err: anyhow::Error, during_instantiation: bool) -> Result<bool, PrecompileError> {
    if let Some(exit) = err.downcast_ref::<wasmtime_wasi::I32Exit>() {
        return if exit.0 == 0 {
            Ok(true)
        } else {
            Err(PrecompileError::Execution(err))
        };
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::OutOfFuel) => Ok(false),
        Some(Trap::Interrupt) => Err(PrecompileError::Deadline),
        _ if during_instantiation => Err(PrecompileError::Instantiate(err)),
        _ => Err(PrecompileError::Execution(err)),
    }
}
