use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lb_core::{BridgeError, GcOperation, HostValue};
use mlua::{Lua, MultiValue};

use crate::bridge::{host_to_lua, lua_to_host};
use crate::registry::{install_trampoline, FunctionRegistry};
use crate::scheduler::{AsyncTask, TaskPayload, TaskScheduler};

/// Status code an open runner reports. The interpreter's main state is never
/// observed suspended from the host side, so this mirrors `LUA_OK`.
pub const STATUS_OK: i32 = 0;

pub type ExecCallback = Box<dyn FnOnce(Result<HostValue, BridgeError>) + Send>;

/// The interpreter handle shared between the runner and its workers. The
/// mutex is the serialization layer: exactly one logical operation touches
/// the interpreter at a time. `None` means the runner was closed.
pub(crate) type SharedInstance = Arc<Mutex<Option<Lua>>>;

#[derive(Debug, Clone)]
pub struct ScriptRunnerOptions {
    /// Size of the bounded worker pool handling async executions.
    pub worker_threads: usize,
}

impl Default for ScriptRunnerOptions {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

/// Owns one interpreter instance with the full standard library preloaded,
/// the per-runner function registry, and the async task scheduler.
pub struct ScriptRunner {
    instance: SharedInstance,
    registry: Arc<FunctionRegistry>,
    scheduler: TaskScheduler,
}

impl ScriptRunner {
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_options(ScriptRunnerOptions::default())
    }

    pub fn with_options(options: ScriptRunnerOptions) -> Result<Self, BridgeError> {
        let instance: SharedInstance = Arc::new(Mutex::new(Some(Lua::new())));
        let scheduler = TaskScheduler::new(Arc::clone(&instance), options.worker_threads)?;
        Ok(Self {
            instance,
            registry: Arc::new(FunctionRegistry::default()),
            scheduler,
        })
    }

    /// Runs `code` on the calling thread, blocking until completion. Returns
    /// the topmost value the chunk left behind, or `Absent` for none.
    pub fn execute_string_sync(&self, code: &str) -> Result<HostValue, BridgeError> {
        self.with_lua(|lua| eval_chunk(lua, code))
    }

    pub fn execute_file_sync(&self, path: impl AsRef<Path>) -> Result<HostValue, BridgeError> {
        self.with_lua(|lua| eval_file(lua, path.as_ref()))
    }

    /// Queues `code` for execution on a worker thread and returns
    /// immediately. The callback, if any, is invoked exactly once from
    /// [`Self::poll_completions`] or [`Self::pump`] on the control thread.
    pub fn execute_string(
        &self,
        code: &str,
        callback: Option<ExecCallback>,
    ) -> Result<(), BridgeError> {
        self.submit(TaskPayload::Chunk(code.to_string()), callback)
    }

    pub fn execute_file(
        &self,
        path: impl AsRef<Path>,
        callback: Option<ExecCallback>,
    ) -> Result<(), BridgeError> {
        self.submit(TaskPayload::File(path.as_ref().to_path_buf()), callback)
    }

    pub fn set_global(&self, name: &str, value: &HostValue) -> Result<(), BridgeError> {
        require_name(name, "RUNNER_GLOBAL_NAME_EMPTY", "Global name")?;
        self.with_lua(|lua| {
            let engine_value = host_to_lua(lua, value).map_err(bind_error)?;
            lua.globals().set(name, engine_value).map_err(bind_error)
        })
    }

    /// Reads a global. Unbound names and unrepresentable values are both
    /// reported as `Absent`.
    pub fn get_global(&self, name: &str) -> Result<HostValue, BridgeError> {
        require_name(name, "RUNNER_GLOBAL_NAME_EMPTY", "Global name")?;
        self.with_lua(|lua| {
            let value: mlua::Value = lua.globals().get(name).map_err(bind_error)?;
            Ok(lua_to_host(&value))
        })
    }

    pub fn status(&self) -> Result<i32, BridgeError> {
        self.with_lua(|_| Ok(STATUS_OK))
    }

    /// Invokes the interpreter's collector and returns the metric the
    /// operation reports.
    pub fn collect_garbage(&self, operation: GcOperation) -> Result<i64, BridgeError> {
        self.with_lua(|lua| match operation {
            GcOperation::Stop => {
                lua.gc_stop();
                Ok(0)
            }
            GcOperation::Restart => {
                lua.gc_restart();
                Ok(0)
            }
            GcOperation::Collect => {
                lua.gc_collect().map_err(gc_error)?;
                Ok(0)
            }
            GcOperation::Count => Ok((lua.used_memory() / 1024) as i64),
            GcOperation::CountBytes => Ok((lua.used_memory() % 1024) as i64),
            GcOperation::Step => Ok(i64::from(lua.gc_step().map_err(gc_error)?)),
            GcOperation::IsRunning => Ok(i64::from(lua.gc_is_running())),
        })
    }

    /// Registers a host callable under `name` and installs its trampoline in
    /// the interpreter's globals. Registering an existing name replaces the
    /// callable; trampolines resolve the name on every call.
    pub fn register_function<F>(&self, name: &str, function: F) -> Result<(), BridgeError>
    where
        F: Fn(&[HostValue]) -> HostValue + Send + Sync + 'static,
    {
        require_name(name, "REGISTRY_NAME_EMPTY", "Function name")?;
        self.with_lua(|lua| {
            self.registry.insert(name, Arc::new(function));
            install_trampoline(lua, &self.registry, name)
        })
    }

    /// Tears down the interpreter. Every later operation, including a second
    /// close, fails with `RUNNER_CLOSED`; tasks still queued or running
    /// complete with the same error through their callback.
    pub fn close(&self) -> Result<(), BridgeError> {
        let mut guard = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(lua) => {
                drop(lua);
                tracing::debug!("interpreter closed");
                Ok(())
            }
            None => Err(closed_error()),
        }
    }

    /// Dispatches every async completion already waiting, invoking callbacks
    /// on the calling thread. Returns the number of tasks dispatched.
    pub fn poll_completions(&self) -> usize {
        self.scheduler.poll()
    }

    /// Like [`Self::poll_completions`] but blocks up to `timeout` for the
    /// first completion.
    pub fn pump(&self, timeout: Duration) -> usize {
        self.scheduler.pump(timeout)
    }

    fn submit(
        &self,
        payload: TaskPayload,
        callback: Option<ExecCallback>,
    ) -> Result<(), BridgeError> {
        // Fast-path rejection; a task racing a concurrent close still
        // completes through its callback with the closed error.
        if self
            .instance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return Err(closed_error());
        }
        self.scheduler.submit(AsyncTask { payload, callback })
    }

    fn with_lua<T>(
        &self,
        operation: impl FnOnce(&Lua) -> Result<T, BridgeError>,
    ) -> Result<T, BridgeError> {
        let guard = self.instance.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(lua) => operation(lua),
            None => Err(closed_error()),
        }
    }
}

pub(crate) fn closed_error() -> BridgeError {
    BridgeError::new("RUNNER_CLOSED", "Script runner is closed.")
}

pub(crate) fn bind_error(error: mlua::Error) -> BridgeError {
    BridgeError::new(
        "ENGINE_BIND_FAILED",
        format!("Interpreter binding failed: {}", error),
    )
}

fn gc_error(error: mlua::Error) -> BridgeError {
    BridgeError::new(
        "ENGINE_GC_FAILED",
        format!("Garbage collection failed: {}", error),
    )
}

fn require_name(name: &str, code: &str, what: &str) -> Result<(), BridgeError> {
    if name.is_empty() {
        return Err(BridgeError::new(code, format!("{} must not be empty.", what)));
    }
    Ok(())
}

pub(crate) fn eval_chunk(lua: &Lua, code: &str) -> Result<HostValue, BridgeError> {
    let values = lua.load(code).eval::<MultiValue>().map_err(|error| {
        BridgeError::new(
            "RUNNER_EXECUTION_FAILED",
            format!("Execution Of Lua Code Has Failed:\n{}\n", error),
        )
    })?;
    Ok(top_of_stack(&values))
}

pub(crate) fn eval_file(lua: &Lua, path: &Path) -> Result<HostValue, BridgeError> {
    let failed = |diagnostic: String| {
        BridgeError::new(
            "RUNNER_EXECUTION_FAILED",
            format!(
                "Execution Of File {} Has Failed:\n{}\n",
                path.display(),
                diagnostic
            ),
        )
    };
    let source = fs::read_to_string(path).map_err(|error| failed(error.to_string()))?;
    let values = lua
        .load(source.as_str())
        .set_name(format!("@{}", path.display()))
        .eval::<MultiValue>()
        .map_err(|error| failed(error.to_string()))?;
    Ok(top_of_stack(&values))
}

fn top_of_stack(values: &MultiValue) -> HostValue {
    values
        .iter()
        .last()
        .map(lua_to_host)
        .unwrap_or(HostValue::Absent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScriptRunner {
        ScriptRunner::new().expect("runner should build")
    }

    #[test]
    fn execute_string_sync_returns_top_of_stack() {
        let runner = runner();
        let value = runner
            .execute_string_sync("return 1 + 1")
            .expect("execution should pass");
        assert_eq!(value, HostValue::Number(2.0));
    }

    #[test]
    fn chunk_without_result_returns_absent() {
        let runner = runner();
        let value = runner
            .execute_string_sync("local x = 1")
            .expect("execution should pass");
        assert!(value.is_absent());
    }

    #[test]
    fn malformed_chunk_embeds_native_diagnostic() {
        let runner = runner();
        let error = runner
            .execute_string_sync("return (")
            .expect_err("malformed chunk should fail");
        assert_eq!(error.code, "RUNNER_EXECUTION_FAILED");
        assert!(error
            .message
            .starts_with("Execution Of Lua Code Has Failed:\n"));
        assert!(error.message.ends_with('\n'));
        assert!(error.message.len() > "Execution Of Lua Code Has Failed:\n\n".len());
    }

    #[test]
    fn runtime_error_embeds_native_diagnostic() {
        let runner = runner();
        let error = runner
            .execute_string_sync("error('boom')")
            .expect_err("raised error should fail");
        assert_eq!(error.code, "RUNNER_EXECUTION_FAILED");
        assert!(error.message.contains("boom"));
    }

    #[test]
    fn globals_round_trip_through_the_bridge() {
        let runner = runner();
        let value = HostValue::Sequence(vec![
            HostValue::Number(1.0),
            HostValue::String("two".to_string()),
        ]);
        runner.set_global("payload", &value).expect("set should pass");
        let read = runner.get_global("payload").expect("get should pass");
        assert_eq!(read, value);

        let doubled = runner
            .execute_string_sync("return payload[1] * 2")
            .expect("execution should pass");
        assert_eq!(doubled, HostValue::Number(2.0));
    }

    #[test]
    fn unbound_global_reads_as_absent() {
        let runner = runner();
        let value = runner.get_global("missing").expect("get should pass");
        assert!(value.is_absent());
    }

    #[test]
    fn empty_names_are_rejected_before_the_interpreter() {
        let runner = runner();
        let error = runner
            .set_global("", &HostValue::Number(1.0))
            .expect_err("empty global name should fail");
        assert_eq!(error.code, "RUNNER_GLOBAL_NAME_EMPTY");

        let error = runner
            .register_function("", |_| HostValue::Absent)
            .expect_err("empty function name should fail");
        assert_eq!(error.code, "REGISTRY_NAME_EMPTY");

        // The runner stays usable after a validation error.
        runner
            .execute_string_sync("return 0")
            .expect("execution should pass");
    }

    #[test]
    fn status_reports_ok_while_open() {
        let runner = runner();
        assert_eq!(runner.status().expect("status should pass"), STATUS_OK);
    }

    #[test]
    fn gc_count_matches_memory_in_use() {
        let runner = runner();
        runner
            .collect_garbage(GcOperation::Stop)
            .expect("gc stop should pass");
        let count = runner
            .collect_garbage(GcOperation::Count)
            .expect("gc count should pass");
        let bytes = runner
            .collect_garbage(GcOperation::CountBytes)
            .expect("gc count bytes should pass");
        assert!(count >= 0);
        assert!((0..1024).contains(&bytes));
        runner
            .collect_garbage(GcOperation::Restart)
            .expect("gc restart should pass");
        runner
            .collect_garbage(GcOperation::Collect)
            .expect("gc collect should pass");
    }

    #[test]
    fn registered_function_round_trips_arguments_and_result() {
        let runner = runner();
        runner
            .register_function("add", |args| {
                let sum = args.iter().filter_map(HostValue::as_number).sum();
                HostValue::Number(sum)
            })
            .expect("register should pass");
        let value = runner
            .execute_string_sync("return add(2, 3)")
            .expect("execution should pass");
        assert_eq!(value, HostValue::Number(5.0));
    }

    #[test]
    fn registering_a_name_twice_replaces_the_binding() {
        let runner = runner();
        runner
            .register_function("pick", |_| HostValue::Number(1.0))
            .expect("register should pass");
        runner
            .register_function("pick", |_| HostValue::Number(2.0))
            .expect("register should pass");
        let value = runner
            .execute_string_sync("return pick()")
            .expect("execution should pass");
        assert_eq!(value, HostValue::Number(2.0));
    }

    #[test]
    fn every_operation_fails_uniformly_after_close() {
        let runner = runner();
        runner.close().expect("close should pass");

        assert_eq!(
            runner.execute_string_sync("return 1").expect_err("closed").code,
            "RUNNER_CLOSED"
        );
        assert_eq!(
            runner
                .execute_string("return 1", None)
                .expect_err("closed")
                .code,
            "RUNNER_CLOSED"
        );
        assert_eq!(
            runner.get_global("x").expect_err("closed").code,
            "RUNNER_CLOSED"
        );
        assert_eq!(
            runner
                .set_global("x", &HostValue::Number(1.0))
                .expect_err("closed")
                .code,
            "RUNNER_CLOSED"
        );
        assert_eq!(runner.status().expect_err("closed").code, "RUNNER_CLOSED");
        assert_eq!(
            runner
                .collect_garbage(GcOperation::Count)
                .expect_err("closed")
                .code,
            "RUNNER_CLOSED"
        );
        assert_eq!(
            runner
                .register_function("f", |_| HostValue::Absent)
                .expect_err("closed")
                .code,
            "RUNNER_CLOSED"
        );
        assert_eq!(runner.close().expect_err("closed").code, "RUNNER_CLOSED");
    }
}
