//! Example actor: a small telescope mount
//!
//! Served by `actor-proxy demo-actor` and used by the integration tests.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Value, json};
use thiserror::Error;

use crate::remote_error::{ErrorDescriptor, ErrorRegistry};
use crate::service::{ActorService, CommandContext, CommandResult};
use crate::types::Payload;

/// Module the demo actor's errors are registered under
pub const DEMO_ERROR_MODULE: &str = "actor_proxy::demo";

/// Errors raised by the demo mount
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct MountError(pub String);

impl From<String> for MountError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Register the demo actor's error types.
pub fn demo_errors(registry: &mut ErrorRegistry) -> &mut ErrorRegistry {
    registry.register_type::<MountError>(DEMO_ERROR_MODULE)
}

#[derive(Debug, Default)]
struct MountState {
    enabled: bool,
    axis0: bool,
    axis1: bool,
    ra_h: f64,
    deg_d: f64,
}

type SharedState = Arc<Mutex<MountState>>;

fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, MountState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn mount_error(message: impl Into<String>) -> ErrorDescriptor {
    ErrorDescriptor::from_error(DEMO_ERROR_MODULE, &MountError(message.into()))
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn float_arg(ctx: &CommandContext, index: usize, name: &str) -> Result<f64, ErrorDescriptor> {
    ctx.args
        .positional
        .get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| mount_error(format!("{} expects a number for {name}", ctx.command)))
}

/// `setEnabled ENABLE [--axis0 B] [--axis1 B]`
async fn set_enabled(state: SharedState, ctx: CommandContext) -> CommandResult {
    let enable = ctx
        .args
        .positional
        .first()
        .and_then(Value::as_bool)
        .ok_or_else(|| mount_error("setEnabled expects true or false"))?;
    let axis0 = ctx.args.option_bool("axis0").unwrap_or(true);
    let axis1 = ctx.args.option_bool("axis1").unwrap_or(true);

    let mut mount = lock(&state);
    mount.enabled = enable;
    mount.axis0 = axis0;
    mount.axis1 = axis1;
    Ok(payload(json!({"enable": enable, "axis0": axis0, "axis1": axis1})))
}

/// `gotoRaDecJ2000 RA_H DEG_D`
async fn goto_ra_dec(state: SharedState, ctx: CommandContext) -> CommandResult {
    let ra_h = float_arg(&ctx, 0, "RA_H")?;
    let deg_d = float_arg(&ctx, 1, "DEG_D")?;
    if !lock(&state).enabled {
        return Err(mount_error("mount is disabled"));
    }

    ctx.write(payload(json!({"slewing": true})));
    {
        let mut mount = lock(&state);
        mount.ra_h = ra_h;
        mount.deg_d = deg_d;
    }
    Ok(payload(json!({"ra_h": ra_h, "deg_d": deg_d})))
}

async fn status(state: SharedState, ctx: CommandContext) -> CommandResult {
    let snapshot = {
        let mount = lock(&state);
        json!({
            "enabled": mount.enabled,
            "axis0": {"enabled": mount.axis0},
            "axis1": {"enabled": mount.axis1},
            "position": {"ra_h": mount.ra_h, "deg_d": mount.deg_d},
        })
    };
    ctx.write(payload(json!({"state": "reading"})));
    Ok(payload(snapshot))
}

async fn err_raise(_ctx: CommandContext) -> CommandResult {
    Err(mount_error("boom ..."))
}

async fn err_pass_as_error(_ctx: CommandContext) -> CommandResult {
    Err(mount_error(""))
}

/// The demo actor, served under `name`.
pub fn demo_service(name: &str) -> ActorService {
    let state = SharedState::default();

    ActorService::new(name)
        .command("setEnabled", {
            let state = state.clone();
            move |ctx| set_enabled(state.clone(), ctx)
        })
        .command("gotoRaDecJ2000", {
            let state = state.clone();
            move |ctx| goto_ra_dec(state.clone(), ctx)
        })
        .command("status", {
            let state = state.clone();
            move |ctx| status(state.clone(), ctx)
        })
        .command("errRaise", err_raise)
        .command("errPassAsError", err_pass_as_error)
}
