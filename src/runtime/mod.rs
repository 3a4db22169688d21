//! Script-runtime facade.
//!
//! Each [`ScriptRuntime`] is one QuickJS isolate wired with the built-in
//! module surface. A runtime evaluates the bundled script's top level once
//! (this is when `config.set*` calls take effect) and then has its exported
//! workload function invoked once per iteration.
//!
//! The engine consumes CommonJS-shaped bundles: the external bundler compiles
//! whatever the user wrote down to `module.exports` / `exports.default`
//! assignments, and the reserved module names are left external for the
//! `require` shim installed here to resolve.

mod modules;
pub mod pool;

pub use modules::ModuleServices;
pub use pool::RuntimePool;

use rquickjs::{CatchResultExt, Context, Function, Object, Runtime, Value};

use crate::error::{Error, Result};

/// Installed once per context. `__wrapResponse` gives every HTTP response
/// object its chainable assertion method; `require` resolves the reserved
/// module names against the pre-built `__modules` table.
const PRELUDE: &str = r#"
globalThis.__wrapResponse = function (resp) {
    resp.assertStatus = function (expected) {
        if (resp.status !== expected) {
            __emitAssertFailure(resp.method, resp.url, resp.status);
        }
        return resp;
    };
    resp.assert_status = resp.assertStatus;
    return resp;
};
globalThis.require = function (name) {
    var mod = globalThis.__modules[name];
    if (mod === undefined) {
        throw new Error("Cannot find module '" + name + "'");
    }
    return mod;
};
"#;

/// One isolated script runtime, owned by a single virtual user at a time.
pub struct ScriptRuntime {
    context: Context,
    runtime: Runtime,
}

impl ScriptRuntime {
    pub fn new(services: ModuleServices) -> Result<Self> {
        let runtime = Runtime::new()?;
        let context = Context::full(&runtime)?;
        context.with(|ctx| -> rquickjs::Result<()> {
            modules::register(&ctx, &services)?;
            ctx.eval::<(), _>(PRELUDE)?;
            Ok(())
        })?;
        Ok(Self { context, runtime })
    }

    /// Run the bundled script's top level, binding fresh `module` / `exports`
    /// globals first so repeated evaluations never see a previous export.
    pub fn eval_top_level(&self, code: &str) -> Result<()> {
        self.context.with(|ctx| {
            let setup = || -> rquickjs::Result<()> {
                let module = Object::new(ctx.clone())?;
                let exports = Object::new(ctx.clone())?;
                module.set("exports", exports.clone())?;
                ctx.globals().set("module", module)?;
                ctx.globals().set("exports", exports)?;
                Ok(())
            };
            setup().map_err(Error::from)?;

            let wrapped = format!("(function() {{\n{code}\n}})();");
            ctx.eval::<(), _>(wrapped)
                .catch(&ctx)
                .map_err(|err| Error::Script(err.to_string()))
        })
    }

    /// Invoke the script's iterated body once.
    ///
    /// Entry precedence: a directly callable `module.exports`, else a
    /// callable `module.exports.default`. A script with neither simply has no
    /// iterated body, which is not an error.
    pub fn run_iteration(&self) -> Result<()> {
        self.context.with(|ctx| {
            let exports: Value = ctx
                .globals()
                .get::<_, Object>("module")
                .and_then(|module| module.get("exports"))
                .map_err(Error::from)?;

            let entry: Option<Function> = if let Some(f) = exports.as_function() {
                Some(f.clone())
            } else {
                exports
                    .as_object()
                    .and_then(|o| o.get::<_, Value>("default").ok())
                    .as_ref()
                    .and_then(Value::as_function)
                    .cloned()
            };

            match entry {
                Some(entry) => entry
                    .call::<_, ()>(())
                    .catch(&ctx)
                    .map_err(|err| Error::Script(err.to_string())),
                None => Ok(()),
            }
        })
    }
}

impl Drop for ScriptRuntime {
    fn drop(&mut self) {
        // Collect cycles while the context still exists; the context itself
        // drops before the runtime (field order).
        self.runtime.run_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpClient;
    use crate::config::RunConfig;
    use crate::metric::{MeasurementKind, RecordEmitter};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn services(emitter: RecordEmitter) -> (ModuleServices, Arc<RwLock<RunConfig>>) {
        let config = Arc::new(RwLock::new(RunConfig::default()));
        let services = ModuleServices::new(
            config.clone(),
            emitter,
            HttpClient::new(Default::default()),
            tokio::runtime::Handle::current(),
        );
        (services, config)
    }

    #[tokio::test]
    async fn config_setters_populate_the_shared_config() {
        let (svc, config) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                const config = require("Accelira/config");
                config.setConcurrentUsers(12);
                config.setIterations(5);
                config.setRampUpRate(2);
                config.setDuration("30s");
                "#,
            )
            .unwrap();

        let config = config.read().unwrap();
        assert_eq!(config.concurrent_users, 12);
        assert_eq!(config.iterations, 5);
        assert_eq!(config.ramp_up_rate, 2);
        assert_eq!(config.duration, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn config_getters_reflect_earlier_setters() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                const config = require("Accelira/config");
                config.setIterations(7);
                config.setConcurrentUsers(3);
                globalThis.roundTrip =
                    config.getIterations() === 7 && config.getConcurrentUsers() === 3;
                "#,
            )
            .unwrap();

        runtime.context.with(|ctx| {
            let round_trip: bool = ctx.globals().get("roundTrip").unwrap();
            assert!(round_trip);
        });
    }

    #[tokio::test]
    async fn commonjs_export_is_the_iterated_body() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                globalThis.calls = 0;
                module.exports = function () { globalThis.calls += 1; };
                "#,
            )
            .unwrap();

        runtime.run_iteration().unwrap();
        runtime.run_iteration().unwrap();

        runtime.context.with(|ctx| {
            let calls: i32 = ctx.globals().get("calls").unwrap();
            assert_eq!(calls, 2);
        });
    }

    #[tokio::test]
    async fn default_export_is_used_when_exports_is_not_callable() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                globalThis.calls = 0;
                module.exports.default = function () { globalThis.calls += 1; };
                "#,
            )
            .unwrap();

        runtime.run_iteration().unwrap();

        runtime.context.with(|ctx| {
            let calls: i32 = ctx.globals().get("calls").unwrap();
            assert_eq!(calls, 1);
        });
    }

    #[tokio::test]
    async fn top_level_only_script_iterates_as_a_no_op() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime.eval_top_level("var x = 1;").unwrap();
        runtime.run_iteration().unwrap();
    }

    #[tokio::test]
    async fn iteration_errors_carry_the_script_message() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(r#"module.exports = function () { throw new Error("boom"); };"#)
            .unwrap();

        let err = runtime.run_iteration().unwrap_err();
        assert!(err.to_string().contains("boom"), "got: {err}");
    }

    #[tokio::test]
    async fn group_start_emits_exactly_one_record_even_on_throw() {
        let (tx, mut rx) = mpsc::channel(8);
        let (svc, _) = services(RecordEmitter::new(tx));
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                const group = require("Accelira/group");
                module.exports = function () {
                    group.start("explodes", function () { throw new Error("inner"); });
                };
                "#,
            )
            .unwrap();

        assert!(runtime.run_iteration().is_err());

        let record = rx.recv().await.unwrap();
        assert_eq!(record.key, "group: explodes");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn check_emits_one_record_per_entry() {
        let (tx, mut rx) = mpsc::channel(8);
        let (svc, _) = services(RecordEmitter::new(tx));
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                const assert = require("Accelira/assert");
                module.exports = function () {
                    assert.check({ status: 200 }, {
                        "status is 200": function (r) { return r.status === 200; },
                        "body present": function (r) { return !!r.body; },
                    });
                };
                "#,
            )
            .unwrap();
        runtime.run_iteration().unwrap();

        let mut passed = std::collections::BTreeMap::new();
        for _ in 0..2 {
            let record = rx.recv().await.unwrap();
            match record.kind {
                MeasurementKind::Check { name, passed: p } => {
                    passed.insert(name, p);
                }
                other => panic!("expected a check record, got {other:?}"),
            }
        }
        assert_eq!(passed["status is 200"], true);
        assert_eq!(passed["body present"], false);
    }

    #[tokio::test]
    async fn unknown_module_throws() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        let err = runtime
            .eval_top_level(r#"require("left-pad");"#)
            .unwrap_err();
        assert!(err.to_string().contains("left-pad"), "got: {err}");
    }

    #[tokio::test]
    async fn fs_module_reads_files_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.txt");
        std::fs::write(&path, "file contents").unwrap();

        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(&format!(
                r#"
                const fs = require("fs");
                globalThis.contents = fs.readFileSync("{}", "utf8");
                "#,
                path.display()
            ))
            .unwrap();

        runtime.context.with(|ctx| {
            let contents: String = ctx.globals().get("contents").unwrap();
            assert_eq!(contents, "file contents");
        });
    }

    #[tokio::test]
    async fn fs_module_throws_on_missing_files() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        let err = runtime
            .eval_top_level(r#"require("fs").readFileSync("/definitely/not/here", "utf8");"#)
            .unwrap_err();
        assert!(err.to_string().contains("cannot read"), "got: {err}");
    }

    #[tokio::test]
    async fn jwt_sign_rejects_bad_keys() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();

        let err = runtime
            .eval_top_level(
                r#"require("jsonwebtoken").sign({ sub: "user" }, "", { algorithm: "RS256" });"#,
            )
            .unwrap_err();
        assert!(err.to_string().contains("private key is empty"), "got: {err}");

        let err = runtime
            .eval_top_level(
                r#"require("jsonwebtoken").sign({ sub: "user" }, "not a pem", { algorithm: "RS256" });"#,
            )
            .unwrap_err();
        assert!(
            err.to_string().contains("error parsing private key"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn jwt_sign_rejects_unsupported_algorithms() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        let err = runtime
            .eval_top_level(
                r#"require("jsonwebtoken").sign({ sub: "u" }, "x", { algorithm: "HS256" });"#,
            )
            .unwrap_err();
        assert!(err.to_string().contains("unsupported algorithm"), "got: {err}");
    }

    #[tokio::test]
    async fn crypto_hash_round_trips_to_base64() {
        let (svc, _) = services(RecordEmitter::disabled());
        let runtime = ScriptRuntime::new(svc).unwrap();
        runtime
            .eval_top_level(
                r#"
                const crypto = require("crypto");
                const hash = crypto.createHash("sha256");
                hash.update("abc");
                globalThis.digest = hash.digest("base64");
                globalThis.randomLen = crypto.randomBytes(16).length;
                "#,
            )
            .unwrap();

        runtime.context.with(|ctx| {
            let digest: String = ctx.globals().get("digest").unwrap();
            // sha256("abc"), base64-encoded.
            assert_eq!(digest, "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0=");
            let random_len: i32 = ctx.globals().get("randomLen").unwrap();
            assert_eq!(random_len, 16);
        });
    }
}
