//! Installs the script-facing globals a worker's main function uses:
//! `service.register` for registering RPC services, and `rpc.call` /
//! `rpc.broadcast` for invoking them. Every native entry point here is a
//! plain synchronous function — it must return to the script immediately
//! (§4.2: interpreter tasks never suspend) — so the actual work happens on
//! a native task enqueued via `try_call_native`, and the result reaches the
//! script later through the callback bridge.
//!
//! `rpc.call`/`rpc.broadcast` take `(name, body, options?)` (§4.9): `body`
//! is an arbitrary Lua value, converted through the same JSON value mapping
//! the reply/handler path uses so a request round-trips symmetrically;
//! `options` is an optional table of `{timeout_ms, callback}`, both
//! optional — an omitted `callback` makes the call fire-and-forget.

use mesh_cluster::{GossipTransport, ServiceRegistry};
use mesh_common::{MeshError, Value};
use mesh_exec::{ExecutionContext, InterpreterTask, NativeTask};
use mesh_listener::ListenerManager;
use mesh_rpc::{CallOptions, OutboundDispatcher};
use mlua::{Lua, RegistryKey, Variadic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Per-worker table of registered service handlers, keyed by service name.
/// Plain `std::sync::Mutex` because it is only ever touched from the one
/// interpreter thread, but closures crossing into `mesh-exec`'s task types
/// must be `Send`.
#[derive(Clone, Default)]
pub struct ServiceTable {
    handlers: Arc<Mutex<HashMap<String, RegistryKey>>>,
}

impl ServiceTable {
    pub fn get(&self, name: &str) -> Option<RegistryKey> {
        self.handlers.lock().unwrap().get(name).cloned()
    }

    pub fn clear(&self) {
        self.handlers.lock().unwrap().clear();
    }
}

pub struct BridgeContext {
    pub ec: Arc<ExecutionContext<Lua>>,
    pub dispatcher: Arc<OutboundDispatcher>,
    pub registry: Arc<ServiceRegistry>,
    pub gossip: Option<Arc<GossipTransport>>,
    pub services: ServiceTable,
    pub listeners: Arc<ListenerManager>,
}

/// Invokes a registered handler with `body`, producing the JSON-encoded
/// result or the script error message. Used both by the inbox dispatch loop
/// (worker.rs) and indirectly exercised by the bridge's own tests.
pub fn invoke_handler(lua: &Lua, key: &RegistryKey, body: &[u8]) -> Result<Vec<u8>, MeshError> {
    let handler: mlua::Function = lua
        .registry_value(key)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    let arg = Value::from_json_bytes(body);
    let arg_lua = mesh_lua_value(lua, &arg).map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    let result: mlua::Value = handler
        .call(arg_lua)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    let value = lua_to_mesh_value(&result);
    Ok(value.to_json_bytes())
}

pub fn install(lua: &Lua, ctx: BridgeContext) -> mlua::Result<()> {
    let service_table = lua.create_table()?;
    let services_for_register = ctx.services.clone();
    let registry_for_register = ctx.registry.clone();
    let ec_for_register = ctx.ec.clone();
    let gossip_for_register = ctx.gossip.clone();

    let register_fn = lua.create_function(
        move |lua, (name, weight, handler): (String, f64, mlua::Function)| {
            let key = lua.create_registry_value(handler)?;
            services_for_register
                .handlers
                .lock()
                .unwrap()
                .insert(name.clone(), key);
            registry_for_register.register_local(&name, weight);

            if let Some(gossip) = gossip_for_register.clone() {
                let name = name.clone();
                let _ = ec_for_register.try_call_native(NativeTask::new(Box::new(move |_token| {
                    Box::pin(async move {
                        gossip.publish_local_service(&name, weight, false).await;
                        Ok(())
                    })
                })));
            }
            Ok(())
        },
    )?;
    service_table.set("register", register_fn)?;
    lua.globals().set("service", service_table)?;

    let rpc_table = lua.create_table()?;

    let dispatcher_for_call = ctx.dispatcher.clone();
    let ec_for_call = ctx.ec.clone();
    let call_fn = lua.create_function(
        move |lua, (name, body, options): (String, mlua::Value, Option<mlua::Table>)| {
            let body_bytes = lua_to_mesh_value(&body).to_json_bytes();
            let (timeout_ms, callback) = read_call_options(options);
            let key = callback.map(|cb| lua.create_registry_value(cb)).transpose()?;
            let dispatcher = dispatcher_for_call.clone();
            let ec = ec_for_call.clone();
            let ec_for_reenter = ec_for_call.clone();
            ec.try_call_native(NativeTask::new(Box::new(move |_token| {
                Box::pin(async move {
                    let options = CallOptions {
                        timeout: Duration::from_millis(timeout_ms),
                    };
                    let outcome = dispatcher.call(&name, body_bytes, options).await;
                    let Some(key) = key else { return Ok(()) };
                    ec_for_reenter
                        .call_interpreter(InterpreterTask::Scoped(Box::new(move |lua: &Lua| {
                            deliver_callback(lua, &key, outcome)
                        })))
                        .await
                        .map_err(|err| MeshError::Transient(err.to_string()))
                }))
            })))
            .map_err(|err| mlua::Error::RuntimeError(err.to_string()))?;
            Ok(())
        },
    )?;
    rpc_table.set("call", call_fn)?;

    let dispatcher_for_broadcast = ctx.dispatcher.clone();
    let ec_for_broadcast = ctx.ec.clone();
    let broadcast_fn = lua.create_function(
        move |lua, (name, body, options): (String, mlua::Value, Option<mlua::Table>)| {
            let body_bytes = lua_to_mesh_value(&body).to_json_bytes();
            let (timeout_ms, callback) = read_call_options(options);
            let key = callback.map(|cb| lua.create_registry_value(cb)).transpose()?;
            let dispatcher = dispatcher_for_broadcast.clone();
            let ec = ec_for_broadcast.clone();
            let ec_for_reenter = ec_for_broadcast.clone();
            ec.try_call_native(NativeTask::new(Box::new(move |_token| {
                Box::pin(async move {
                    let options = CallOptions {
                        timeout: Duration::from_millis(timeout_ms),
                    };
                    let outcomes = dispatcher.broadcast(&name, body_bytes, options).await;
                    let Some(key) = key else { return Ok(()) };
                    ec_for_reenter
                        .call_interpreter(InterpreterTask::Scoped(Box::new(move |lua: &Lua| {
                            deliver_broadcast_callback(lua, &key, outcomes)
                        })))
                        .await
                        .map_err(|err| MeshError::Transient(err.to_string()))
                }))
            })))
            .map_err(|err| mlua::Error::RuntimeError(err.to_string()))?;
            Ok(())
        },
    )?;
    rpc_table.set("broadcast", broadcast_fn)?;

    lua.globals().set("rpc", rpc_table)?;

    // `net.create_server` (§4.5): binds (or reuses) a listener through the
    // Listener Manager so a reload that re-registers the same address never
    // stacks a second listener on the port. Accepting/serving connections is
    // a pluggable module (HTTP/WebSocket/raw TCP) and out of scope (§1); this
    // only surfaces the dedup-bind primitive itself to scripts.
    let net_table = lua.create_table()?;
    let listeners_for_create = ctx.listeners.clone();
    let ec_for_create = ctx.ec.clone();
    let create_server_fn = lua.create_function(
        move |lua, (address, callback): (String, mlua::Function)| {
            let key = lua.create_registry_value(callback)?;
            let listeners = listeners_for_create.clone();
            let ec_for_reenter = ec_for_create.clone();
            ec_for_create
                .try_call_native(NativeTask::new(Box::new(move |_token| {
                    Box::pin(async move {
                        let outcome = listeners.get_or_create("tcp", &address).await.map(|_| ());
                        ec_for_reenter
                            .call_interpreter(InterpreterTask::Scoped(Box::new(move |lua: &Lua| {
                                deliver_unit_callback(lua, &key, outcome)
                            })))
                            .await
                            .map_err(|err| MeshError::Transient(err.to_string()))
                    }))
                })))
                .map_err(|err| mlua::Error::RuntimeError(err.to_string()))?;
            Ok(())
        },
    )?;
    net_table.set("create_server", create_server_fn)?;
    lua.globals().set("net", net_table)?;

    Ok(())
}

fn deliver_callback(
    lua: &Lua,
    key: &RegistryKey,
    outcome: Result<Vec<u8>, MeshError>,
) -> Result<(), MeshError> {
    let callback: mlua::Function = lua
        .registry_value(key)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    let args: Variadic<mlua::Value> = match outcome {
        Ok(body) => {
            let value = Value::from_json_bytes(&body);
            let lua_value =
                mesh_lua_value(lua, &value).map_err(|err| MeshError::ScriptFault(err.to_string()))?;
            Variadic::from_iter([mlua::Value::Nil, lua_value])
        }
        Err(err) => Variadic::from_iter([
            mlua::Value::String(lua.create_string(err.into_script_message()).unwrap()),
            mlua::Value::Nil,
        ]),
    };
    callback
        .call::<()>(args)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))
}

/// Like [`deliver_callback`] but for natives with no result value, only a
/// success/error outcome — `net.create_server`'s bind confirmation.
fn deliver_unit_callback(lua: &Lua, key: &RegistryKey, outcome: Result<(), MeshError>) -> Result<(), MeshError> {
    let callback: mlua::Function = lua
        .registry_value(key)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    let args: Variadic<mlua::Value> = match outcome {
        Ok(()) => Variadic::from_iter([mlua::Value::Nil]),
        Err(err) => Variadic::from_iter([mlua::Value::String(
            lua.create_string(err.into_script_message()).unwrap(),
        )]),
    };
    callback
        .call::<()>(args)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))
}

fn deliver_broadcast_callback(
    lua: &Lua,
    key: &RegistryKey,
    outcomes: Vec<Result<Vec<u8>, MeshError>>,
) -> Result<(), MeshError> {
    let callback: mlua::Function = lua
        .registry_value(key)
        .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    let results = lua.create_table().map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    for (idx, outcome) in outcomes.into_iter().enumerate() {
        let entry = lua.create_table().map_err(|err| MeshError::ScriptFault(err.to_string()))?;
        match outcome {
            Ok(body) => {
                let value = Value::from_json_bytes(&body);
                let lua_value = mesh_lua_value(lua, &value)
                    .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
                entry.set("result", lua_value).ok();
            }
            Err(err) => {
                entry.set("error", err.into_script_message()).ok();
            }
        }
        results
            .set(idx + 1, entry)
            .map_err(|err| MeshError::ScriptFault(err.to_string()))?;
    }
    callback
        .call::<()>((mlua::Value::Nil, results))
        .map_err(|err| MeshError::ScriptFault(err.to_string()))
}

/// Default `rpc.call`/`rpc.broadcast` timeout (§4.9 `options?`) when the
/// script passes no `options` table or omits `timeout_ms`.
const DEFAULT_CALL_TIMEOUT_MS: u64 = 5_000;

/// Pulls `timeout_ms`/`callback` out of the optional `options` table
/// (§4.9 `rpc.call(name, body, options?)`). Both fields are themselves
/// optional: a missing `callback` makes the call fire-and-forget.
fn read_call_options(options: Option<mlua::Table>) -> (u64, Option<mlua::Function>) {
    let Some(options) = options else {
        return (DEFAULT_CALL_TIMEOUT_MS, None);
    };
    let timeout_ms: u64 = options.get("timeout_ms").unwrap_or(DEFAULT_CALL_TIMEOUT_MS);
    let callback: Option<mlua::Function> = options.get("callback").ok();
    (timeout_ms, callback)
}

fn mesh_lua_value(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Number(n) => mlua::Value::Number(*n),
        Value::String(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (idx, item) in items.iter().enumerate() {
                table.set(idx + 1, mesh_lua_value(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Map(map) => {
            let table = lua.create_table()?;
            for (key, value) in map {
                table.set(key.as_str(), mesh_lua_value(lua, value)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

fn lua_to_mesh_value(value: &mlua::Value) -> Value {
    match value {
        mlua::Value::Nil => Value::Null,
        mlua::Value::Boolean(b) => Value::Bool(*b),
        mlua::Value::Integer(i) => Value::Number(*i as f64),
        mlua::Value::Number(n) => Value::Number(*n),
        mlua::Value::String(s) => Value::String(s.to_str().map(|s| s.to_string()).unwrap_or_default()),
        mlua::Value::Table(table) => {
            let len = table.raw_len();
            if len > 0 {
                let mut items = Vec::with_capacity(len);
                for idx in 1..=len {
                    let item: mlua::Value = table.get(idx).unwrap_or(mlua::Value::Nil);
                    items.push(lua_to_mesh_value(&item));
                }
                Value::Array(items)
            } else {
                let mut map = std::collections::BTreeMap::new();
                for pair in table.clone().pairs::<String, mlua::Value>().flatten() {
                    map.insert(pair.0, lua_to_mesh_value(&pair.1));
                }
                Value::Map(map)
            }
        }
        _ => Value::Null,
    }
}
