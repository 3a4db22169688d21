//! Native-backed modules exposed to test scripts through `require`.
//!
//! Every module object is pre-built at context initialization and stashed on
//! a hidden `__modules` global; the `require` shim in the prelude only does a
//! lookup. Reserved names: `Accelira/http`, `Accelira/config`,
//! `Accelira/group`, `Accelira/assert`, `fs`, `crypto`, `jsonwebtoken`.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use http::Method;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rand::RngCore;
use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Exception, FromJs, Function, Object, Value};
use sha2::{Digest, Sha256};

use crate::client::HttpClient;
use crate::config::{parse_duration, RunConfig};
use crate::metric::{Measurement, RecordEmitter};

/// Everything a script runtime needs from the host: the shared run
/// configuration, the record queue, the shared HTTP client, and the tokio
/// handle used to drive request futures from the virtual user's thread.
#[derive(Clone)]
pub struct ModuleServices {
    pub config: Arc<RwLock<RunConfig>>,
    pub emitter: RecordEmitter,
    pub client: Arc<HttpClient>,
    pub handle: tokio::runtime::Handle,
}

impl ModuleServices {
    pub fn new(
        config: Arc<RwLock<RunConfig>>,
        emitter: RecordEmitter,
        client: Arc<HttpClient>,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            config,
            emitter,
            client,
            handle,
        }
    }
}

/// Build all module objects and supporting globals for one context.
pub fn register<'js>(ctx: &Ctx<'js>, services: &ModuleServices) -> rquickjs::Result<()> {
    register_console(ctx)?;

    let modules = Object::new(ctx.clone())?;
    modules.set("Accelira/http", http_module(ctx, services)?)?;
    modules.set("Accelira/config", config_module(ctx, services)?)?;
    modules.set("Accelira/group", group_module(ctx, services)?)?;
    modules.set("Accelira/assert", assert_module(ctx, services)?)?;
    modules.set("fs", fs_module(ctx)?)?;
    modules.set("crypto", crypto_module(ctx)?)?;
    modules.set("jsonwebtoken", jwt_module(ctx)?)?;
    ctx.globals().set("__modules", modules)?;

    // Backs the `assertStatus` shim installed by the prelude.
    let emitter = services.emitter.clone();
    ctx.globals().set(
        "__emitAssertFailure",
        Function::new(
            ctx.clone(),
            move |method: String, url: String, observed: f64| {
                emitter.emit(Measurement::http(
                    method,
                    url,
                    observed as u16,
                    Duration::ZERO,
                    Duration::ZERO,
                    Duration::ZERO,
                    Duration::ZERO,
                    0,
                    0,
                    true,
                ));
            },
        )?,
    )?;

    Ok(())
}

fn register_console<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<()> {
    let console = Object::new(ctx.clone())?;
    console.set(
        "log",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            println!("{}", format_values(&ctx, &args));
        })?,
    )?;
    console.set(
        "error",
        Function::new(ctx.clone(), |ctx: Ctx<'js>, args: Rest<Value<'js>>| {
            eprintln!("{}", format_values(&ctx, &args));
        })?,
    )?;
    ctx.globals().set("console", console)
}

fn format_values<'js>(ctx: &Ctx<'js>, args: &[Value<'js>]) -> String {
    args.iter()
        .map(|value| display_value(ctx, value))
        .collect::<Vec<_>>()
        .join(" ")
}

fn display_value<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> String {
    if let Some(s) = value.as_string() {
        return s.to_string().unwrap_or_default();
    }
    if value.is_object() {
        if let Ok(Some(json)) = ctx.json_stringify(value.clone()) {
            if let Ok(s) = json.to_string() {
                return s;
            }
        }
    }
    Coerced::<String>::from_js(ctx, value.clone())
        .map(|c| c.0)
        .unwrap_or_else(|_| String::from("undefined"))
}

// ---------------------------------------------------------------------------
// Accelira/http

fn http_module<'js>(ctx: &Ctx<'js>, services: &ModuleServices) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;

    let svc = services.clone();
    module.set(
        "get",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: String| -> rquickjs::Result<Object<'js>> {
                perform_request(ctx, &svc, Method::GET, url, None)
            },
        )?,
    )?;

    let svc = services.clone();
    module.set(
        "post",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  url: String,
                  body: Opt<Coerced<String>>|
                  -> rquickjs::Result<Object<'js>> {
                perform_request(ctx, &svc, Method::POST, url, body.0.map(|c| c.0))
            },
        )?,
    )?;

    let svc = services.clone();
    module.set(
        "put",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>,
                  url: String,
                  body: Opt<Coerced<String>>|
                  -> rquickjs::Result<Object<'js>> {
                perform_request(ctx, &svc, Method::PUT, url, body.0.map(|c| c.0))
            },
        )?,
    )?;

    let svc = services.clone();
    module.set(
        "delete",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, url: String| -> rquickjs::Result<Object<'js>> {
                perform_request(ctx, &svc, Method::DELETE, url, None)
            },
        )?,
    )?;

    Ok(module)
}

/// Drive one request to completion from the virtual user's thread and shape
/// the response for the script.
fn perform_request<'js>(
    ctx: Ctx<'js>,
    services: &ModuleServices,
    method: Method,
    url: String,
    body: Option<String>,
) -> rquickjs::Result<Object<'js>> {
    let client = services.client.clone();
    let emitter = services.emitter.clone();
    let response = services
        .handle
        .block_on(async move { client.do_request(method, &url, body, &emitter).await });

    let object = Object::new(ctx.clone())?;
    object.set("status", response.status_code as i32)?;
    object.set("statusCode", response.status_code as i32)?;
    object.set("body", response.body)?;
    object.set("url", response.url)?;
    object.set("method", response.method)?;
    object.set("error", response.error)?;
    object.set("duration", millis(response.duration))?;
    object.set(
        "tcpHandshakeLatency",
        millis(response.tcp_handshake_latency),
    )?;
    object.set(
        "tlsHandshakeLatency",
        millis(response.tls_handshake_latency),
    )?;
    object.set("dnsLookupLatency", millis(response.dns_lookup_latency))?;

    // The prelude attaches `assertStatus` / `assert_status` and returns the
    // same object so script-side chaining works.
    let wrap: Function = ctx.globals().get("__wrapResponse")?;
    wrap.call::<_, ()>((object.clone(),))?;
    Ok(object)
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

// ---------------------------------------------------------------------------
// Accelira/config

fn config_module<'js>(ctx: &Ctx<'js>, services: &ModuleServices) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;

    let config = services.config.clone();
    module.set(
        "setIterations",
        Function::new(ctx.clone(), move |n: f64| {
            config.write().expect("config lock").iterations = n.max(0.0) as u64;
        })?,
    )?;

    let config = services.config.clone();
    module.set(
        "setRampUpRate",
        Function::new(ctx.clone(), move |n: f64| {
            config.write().expect("config lock").ramp_up_rate = n.max(0.0) as u64;
        })?,
    )?;

    let config = services.config.clone();
    module.set(
        "setConcurrentUsers",
        Function::new(ctx.clone(), move |n: f64| {
            config.write().expect("config lock").concurrent_users = n.max(0.0) as usize;
        })?,
    )?;

    let config = services.config.clone();
    module.set(
        "setDuration",
        Function::new(
            ctx.clone(),
            move |ctx: Ctx<'js>, s: String| -> rquickjs::Result<()> {
                match parse_duration(&s) {
                    Ok(duration) => {
                        config.write().expect("config lock").duration = duration;
                        Ok(())
                    }
                    Err(err) => Err(Exception::throw_message(&ctx, &err.to_string())),
                }
            },
        )?,
    )?;

    let config = services.config.clone();
    module.set(
        "getIterations",
        Function::new(ctx.clone(), move || {
            config.read().expect("config lock").iterations as f64
        })?,
    )?;

    let config = services.config.clone();
    module.set(
        "getRampUpRate",
        Function::new(ctx.clone(), move || {
            config.read().expect("config lock").ramp_up_rate as f64
        })?,
    )?;

    let config = services.config.clone();
    module.set(
        "getConcurrentUsers",
        Function::new(ctx.clone(), move || {
            config.read().expect("config lock").concurrent_users as f64
        })?,
    )?;

    let config = services.config.clone();
    module.set(
        "getDuration",
        Function::new(ctx.clone(), move || {
            millis(config.read().expect("config lock").duration)
        })?,
    )?;

    Ok(module)
}

// ---------------------------------------------------------------------------
// Accelira/group

fn group_module<'js>(ctx: &Ctx<'js>, services: &ModuleServices) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;

    let emitter = services.emitter.clone();
    module.set(
        "start",
        Function::new(
            ctx.clone(),
            move |name: String, f: Function<'js>| -> rquickjs::Result<()> {
                let started = Instant::now();
                let result = f.call::<_, ()>(());
                // The group record is emitted even when the inner function
                // throws; the exception then propagates to the iteration.
                emitter.emit(Measurement::group(name, started.elapsed()));
                result
            },
        )?,
    )?;

    Ok(module)
}

// ---------------------------------------------------------------------------
// Accelira/assert

fn assert_module<'js>(ctx: &Ctx<'js>, services: &ModuleServices) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;

    let emitter = services.emitter.clone();
    module.set(
        "check",
        Function::new(
            ctx.clone(),
            move |resp: Value<'js>, checks: Object<'js>| -> rquickjs::Result<bool> {
                let mut all_passed = true;
                for entry in checks.props::<String, Value>() {
                    let (name, predicate) = entry?;
                    let passed = predicate
                        .as_function()
                        .map(|f| {
                            f.call::<_, Coerced<bool>>((resp.clone(),))
                                .map(|c| c.0)
                                // A throwing predicate counts as a failed check.
                                .unwrap_or(false)
                        })
                        .unwrap_or(false);
                    emitter.emit(Measurement::check(name, passed));
                    all_passed &= passed;
                }
                Ok(all_passed)
            },
        )?,
    )?;

    Ok(module)
}

// ---------------------------------------------------------------------------
// fs

fn fs_module<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;
    module.set(
        "readFileSync",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, path: String, _encoding: Opt<String>| -> rquickjs::Result<String> {
                std::fs::read_to_string(&path).map_err(|err| {
                    Exception::throw_message(&ctx, &format!("cannot read {path}: {err}"))
                })
            },
        )?,
    )?;
    Ok(module)
}

// ---------------------------------------------------------------------------
// crypto

fn crypto_module<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;

    module.set(
        "randomBytes",
        Function::new(ctx.clone(), |n: f64| -> Vec<u8> {
            let mut bytes = vec![0u8; n.max(0.0) as usize];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        })?,
    )?;

    module.set(
        "createHash",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>, _algorithm: Opt<String>| -> rquickjs::Result<Object<'js>> {
                let state = Arc::new(Mutex::new(Sha256::new()));
                let object = Object::new(ctx.clone())?;

                let hasher = state.clone();
                object.set(
                    "update",
                    Function::new(ctx.clone(), move |data: Coerced<String>| {
                        hasher.lock().expect("hash lock").update(data.0.as_bytes());
                    })?,
                )?;

                object.set(
                    "digest",
                    Function::new(ctx.clone(), move |_encoding: Opt<String>| -> String {
                        let digest = state.lock().expect("hash lock").clone().finalize();
                        BASE64.encode(digest)
                    })?,
                )?;

                Ok(object)
            },
        )?,
    )?;

    module.set(
        "createHmac",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>,
             _algorithm: Opt<String>,
             key: Coerced<String>|
             -> rquickjs::Result<Object<'js>> {
                let mac = Hmac::<Sha256>::new_from_slice(key.0.as_bytes())
                    .map_err(|err| Exception::throw_message(&ctx, &err.to_string()))?;
                let state = Arc::new(Mutex::new(mac));
                let object = Object::new(ctx.clone())?;

                let update_state = state.clone();
                object.set(
                    "update",
                    Function::new(ctx.clone(), move |data: Coerced<String>| {
                        update_state
                            .lock()
                            .expect("hmac lock")
                            .update(data.0.as_bytes());
                    })?,
                )?;

                object.set(
                    "digest",
                    Function::new(ctx.clone(), move |_encoding: Opt<String>| -> String {
                        let digest = state.lock().expect("hmac lock").clone().finalize();
                        BASE64.encode(digest.into_bytes())
                    })?,
                )?;

                Ok(object)
            },
        )?,
    )?;

    Ok(module)
}

// ---------------------------------------------------------------------------
// jsonwebtoken

fn jwt_module<'js>(ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
    let module = Object::new(ctx.clone())?;

    module.set(
        "sign",
        Function::new(
            ctx.clone(),
            |ctx: Ctx<'js>,
             payload: Value<'js>,
             private_key: String,
             options: Opt<Object<'js>>|
             -> rquickjs::Result<String> {
                if private_key.is_empty() {
                    return Err(Exception::throw_message(&ctx, "private key is empty"));
                }

                let json = ctx
                    .json_stringify(payload)?
                    .ok_or_else(|| Exception::throw_message(&ctx, "payload is not serializable"))?
                    .to_string()?;
                let mut claims: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_str(&json).map_err(|err| {
                        Exception::throw_message(&ctx, &format!("invalid payload: {err}"))
                    })?;

                if let Some(options) = options.0 {
                    if let Ok(algorithm) = options.get::<_, String>("algorithm") {
                        if algorithm != "RS256" {
                            return Err(Exception::throw_message(
                                &ctx,
                                &format!("unsupported algorithm {algorithm:?}"),
                            ));
                        }
                    }
                    if let Ok(expires) = options.get::<_, Value>("expiresIn") {
                        if let Some(seconds) = expires_in_seconds(&ctx, &expires)? {
                            let now = SystemTime::now()
                                .duration_since(UNIX_EPOCH)
                                .unwrap_or_default()
                                .as_secs();
                            claims.insert("exp".into(), serde_json::json!(now + seconds));
                        }
                    }
                }

                let key = EncodingKey::from_rsa_pem(private_key.as_bytes()).map_err(|err| {
                    Exception::throw_message(&ctx, &format!("error parsing private key: {err}"))
                })?;
                jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(
                    |err| Exception::throw_message(&ctx, &format!("error signing token: {err}")),
                )
            },
        )?,
    )?;

    Ok(module)
}

/// `expiresIn` accepts a number of seconds or a duration string in the same
/// `"30s"` / `"2m"` forms as `setDuration`.
fn expires_in_seconds<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<Option<u64>> {
    if value.is_undefined() || value.is_null() {
        return Ok(None);
    }
    if let Some(seconds) = value.as_number() {
        return Ok(Some(seconds.max(0.0) as u64));
    }
    if let Some(s) = value.as_string() {
        let s = s.to_string()?;
        return match parse_duration(&s) {
            Ok(duration) => Ok(Some(duration.as_secs())),
            Err(err) => Err(Exception::throw_message(ctx, &err.to_string())),
        };
    }
    Err(Exception::throw_message(
        ctx,
        "expiresIn must be a number of seconds or a duration string",
    ))
}
