//! Shell script composition for managed runs
//!
//! The agent has no in-container process handle, so the whole run
//! lifecycle is delegated to shell executed via `exec`: an outer launcher
//! that owns the pid-file mutex, an inner script that does the actual
//! work detached in its own session, and a stop script that signals the
//! recorded process group. The exact shell behavior here (setsid session
//! leadership, `/proc` probing, `kill -- -pgid`) is the contract between
//! the agent and the container.

use crate::config::{NpmCacheMode, RunConfiguration};
use crate::workspace::ContainerLayout;

use super::project::LaunchPlan;
use super::types::{RunMeta, RunType};

/// Exit code of the outer launcher when a live pid file already exists.
pub const EXIT_ALREADY_RUNNING: i32 = 42;

/// Marker the outer launcher prints on success.
pub const LAUNCHED_PREFIX: &str = "LAUNCHED:";

/// Everything the script generators need to know about one launch.
#[derive(Debug, Clone)]
pub struct ScriptContext {
    pub run_type: RunType,
    pub user_id: u64,
    pub app_id: u64,

    /// Container-side paths
    pub layout: ContainerLayout,

    /// Container-side directory holding `package.json`
    pub workdir: String,

    /// Container-side log file for this task
    pub log_path: String,

    /// Launch epoch, seconds
    pub started_at: i64,

    /// Exposed container port (DEV/START takeover target)
    pub container_port: u16,

    /// Launch plan for long-running tasks
    pub plan: Option<LaunchPlan>,

    pub run_config: RunConfiguration,
}

/// Render a `current.json` body with shell-substituted pid/exit/finished
/// fields. `pid`, `exit_code` and `finished_at` are shell expressions
/// (e.g. `"$$"` or `null`).
fn meta_json(ctx: &ScriptContext, pid: &str, exit_code: &str, finished_at: &str) -> String {
    format!(
        r#"{{"appId":{},"type":"{}","pid":{},"startedAt":{},"finishedAt":{},"exitCode":{},"logPath":"{}"}}"#,
        ctx.app_id, ctx.run_type, pid, ctx.started_at, finished_at, exit_code, ctx.log_path,
    )
}

/// Initial run meta written by the outer launcher before the inner script
/// exists: no pid yet.
pub fn initial_meta(ctx: &ScriptContext) -> RunMeta {
    RunMeta {
        app_id: ctx.app_id,
        run_type: ctx.run_type,
        pid: None,
        started_at: ctx.started_at,
        finished_at: None,
        exit_code: None,
        log_path: ctx.log_path.clone(),
    }
}

/// The outer launcher, executed via engine exec.
///
/// Owns the on-disk mutex: a live pid in `dev.pid` means another task is
/// current and the launcher exits 42 without touching anything. Otherwise
/// it seeds `current.json`, detaches the inner script into its own session
/// (so the recorded pid is the group leader the stop path can signal) and
/// reports `LAUNCHED:<initial state>`.
pub fn outer_launcher(ctx: &ScriptContext) -> String {
    let run_dir = ctx.layout.run_dir();
    let pid_file = ctx.layout.pid_file();
    let current = ctx.layout.current_json();
    let inner = ctx.layout.inner_script();
    let initial = serde_json::to_string(&initial_meta(ctx)).unwrap_or_default();
    let state = ctx.run_type.initial_state();

    format!(
        r#"RUN_DIR='{run_dir}'
PID_FILE='{pid_file}'
mkdir -p "$RUN_DIR"
if [ -f "$PID_FILE" ]; then
  pid=$(cat "$PID_FILE" 2>/dev/null || true)
  if [ -n "$pid" ] && kill -0 "$pid" 2>/dev/null; then
    exit {exit_already}
  fi
  rm -f "$PID_FILE"
fi
cat > '{current}.tmp' <<'CURRENT_JSON'
{initial}
CURRENT_JSON
mv '{current}.tmp' '{current}'
: > '{log_path}'
setsid sh '{inner}' >> '{log_path}' 2>&1 &
echo $! > "$PID_FILE"
echo '{launched}{state}'
"#,
        run_dir = run_dir,
        pid_file = pid_file,
        current = current,
        initial = initial,
        log_path = ctx.log_path,
        inner = inner,
        exit_already = EXIT_ALREADY_RUNNING,
        launched = LAUNCHED_PREFIX,
        state = state,
    )
}

/// The inner script, written to `run/managed-start.sh` on the shared
/// mount before the launcher is executed.
pub fn inner_script(ctx: &ScriptContext) -> String {
    let mut script = String::new();

    script.push_str("#!/bin/sh\n");
    script.push_str(&format!("RUN_DIR='{}'\n", ctx.layout.run_dir()));
    script.push_str(&format!("META='{}'\n", ctx.layout.current_json()));
    script.push_str(&format!("PID_FILE='{}'\n", ctx.layout.pid_file()));
    script.push_str(&format!("APP_DIR='{}'\n", ctx.workdir));
    script.push('\n');

    // Meta rewriting: regenerate the whole document; mv keeps it atomic
    // for concurrent observer reads.
    script.push_str("write_meta() {\n  cat > \"$META.tmp\" <<META_EOF\n");
    script.push_str(&meta_json(ctx, "${1}", "${2}", "${3}"));
    script.push_str("\nMETA_EOF\n  mv \"$META.tmp\" \"$META\"\n}\n\n");

    // Completion bookkeeping. Long-running tasks keep their pid in the
    // meta so a crashed dev server probes dead instead of looking like a
    // slow start; finite tasks null it out.
    let final_pid = if ctx.run_type.is_long_running() {
        "$$"
    } else {
        "null"
    };
    script.push_str("finish() {\n");
    script.push_str(&format!(
        "  write_meta {} \"$1\" \"$(date +%s)\"\n",
        final_pid
    ));
    script.push_str("  rm -f \"$PID_FILE\"\n");
    if ctx.run_config.npm_cache_mode == NpmCacheMode::Disabled {
        script.push_str("  [ -n \"$NPM_CACHE\" ] && rm -rf \"$NPM_CACHE\"\n");
    }
    script.push_str("  exit \"$1\"\n}\n\n");

    script.push_str("[ -d \"$APP_DIR\" ] || { echo 'app directory missing'; finish 2; }\n");
    script.push_str("cd \"$APP_DIR\"\n");
    script.push_str("[ -f package.json ] || { echo 'package.json not found'; finish 2; }\n\n");

    script.push_str(&ps_shim_block(ctx));
    script.push_str(&npm_cache_block(ctx));

    if let Some(plan) = &ctx.plan {
        for (key, value) in &plan.env {
            script.push_str(&format!("{}='{}'\nexport {}\n", key, value, key));
        }
        script.push('\n');
    }

    match ctx.run_type {
        RunType::Install => script.push_str(&install_body(ctx)),
        RunType::Build => script.push_str(&build_body()),
        RunType::Dev | RunType::Start => match &ctx.plan {
            Some(plan) => script.push_str(&long_running_body(ctx, plan)),
            // Unreachable through the engine, which always plans
            // long-running launches; fail the task instead of panicking.
            None => script.push_str("echo 'no launch plan'\nfinish 2\n"),
        },
    }

    script
}

/// Install a minimal `ps` replacement when the image has none.
/// `concurrently` shells out to `ps -o pid --no-headers --ppid <PPID>`
/// to find its children; the shim answers that one query from `/proc`.
fn ps_shim_block(ctx: &ScriptContext) -> String {
    let bin_dir = ctx.layout.shim_bin_dir();
    format!(
        r#"if ! command -v ps >/dev/null 2>&1; then
  mkdir -p '{bin_dir}'
  cat > '{bin_dir}/ps' <<'PS_SHIM'
#!/bin/sh
ppid=""
while [ $# -gt 0 ]; do
  case "$1" in
    --ppid) ppid=$2; shift 2 ;;
    *) shift ;;
  esac
done
[ -n "$ppid" ] || exit 0
for st in /proc/[0-9]*/status; do
  p=$(awk '/^PPid:/{{print $2}}' "$st" 2>/dev/null)
  if [ "$p" = "$ppid" ]; then
    d=${{st#/proc/}}
    echo "  ${{d%%/*}}"
  fi
done
PS_SHIM
  chmod +x '{bin_dir}/ps'
  PATH="{bin_dir}:$PATH"
  export PATH
fi

"#,
        bin_dir = bin_dir,
    )
}

/// npm cache placement and size-cap trimming.
fn npm_cache_block(ctx: &ScriptContext) -> String {
    let mut block = String::new();
    match ctx.run_config.npm_cache_mode {
        NpmCacheMode::App => {
            block.push_str("NPM_CACHE=\"$APP_DIR/.npm-cache\"\n");
            block.push_str("npm_config_cache=\"$NPM_CACHE\"\nexport npm_config_cache\n");
        }
        NpmCacheMode::Disabled => {
            block.push_str("NPM_CACHE=\"/tmp/npm-cache-$$\"\n");
            block.push_str("npm_config_cache=\"$NPM_CACHE\"\nexport npm_config_cache\n");
        }
        NpmCacheMode::Container => return String::new(),
    }

    block.push_str(&format!(
        r#"if [ -d "$NPM_CACHE" ]; then
  cache_mb=$(du -sm "$NPM_CACHE" 2>/dev/null | awk '{{print $1}}')
  if [ -n "$cache_mb" ] && [ "$cache_mb" -gt {max_mb} ]; then
    echo "npm cache ${{cache_mb}}MB over cap, trimming"
    find "$NPM_CACHE" -mindepth 1 -maxdepth 1 -exec rm -rf {{}} +
  fi
fi

"#,
        max_mb = ctx.run_config.npm_cache_max_mb,
    ));
    block
}

fn install_body(ctx: &ScriptContext) -> String {
    let mut body = String::new();
    body.push_str("write_meta \"$$\" null null\n");
    if !ctx.run_config.npm_registry.is_empty() {
        body.push_str(&format!(
            "printf 'registry=%s\\n' '{}' > .npmrc\n",
            ctx.run_config.npm_registry
        ));
    }
    body.push_str(
        r#"npm install --include=dev
rc=$?
if [ "$rc" -ne 0 ]; then
  echo 'npm install failed, retrying with --legacy-peer-deps'
  npm install --include=dev --legacy-peer-deps
  rc=$?
fi
finish "$rc"
"#,
    );
    body
}

fn build_body() -> String {
    r#"write_meta "$$" null null
if [ ! -d node_modules ]; then
  echo 'node_modules missing, installing first'
  npm install --include=dev || finish $?
fi
npm run build
finish $?
"#
    .to_string()
}

/// DEV/START: take over the port, spawn the planned command(s) inside this
/// session, record the session pid, and shepherd the primary child.
fn long_running_body(ctx: &ScriptContext, plan: &super::project::LaunchPlan) -> String {
    let mut body = port_takeover_block(ctx.container_port);

    body.push_str(&format!("{} &\nchild=$!\n", plan.primary));
    if let Some(secondary) = &plan.secondary {
        body.push_str(&format!("{} &\n", secondary));
    }
    body.push_str("write_meta \"$$\" null null\n");
    body.push_str("wait \"$child\"\nfinish $?\n");
    body
}

/// Kill whatever currently listens on the target port. Resolves the
/// listener's socket inode from `/proc/net/tcp[6]`, then walks every
/// process's fd table to find the owner.
fn port_takeover_block(port: u16) -> String {
    format!(
        r#"port_hex=$(printf '%04X' {port})
for tbl in /proc/net/tcp /proc/net/tcp6; do
  [ -r "$tbl" ] || continue
  for inode in $(awk -v p=":$port_hex" '$2 ~ (p "$") && $4 == "0A" {{print $10}}' "$tbl"); do
    for fd in /proc/[0-9]*/fd/*; do
      [ "$(readlink "$fd" 2>/dev/null)" = "socket:[$inode]" ] || continue
      holder=${{fd#/proc/}}
      holder=${{holder%%/*}}
      [ "$holder" = "$$" ] && continue
      echo "killing pid $holder holding port {port}"
      kill -TERM "$holder" 2>/dev/null
      sleep 1
      kill -KILL "$holder" 2>/dev/null
    done
  done
done

"#,
        port = port,
    )
}

/// Stop the current run: TERM the recorded group, give it a second, KILL
/// it, then drop the run files. Prints `STOPPED:1` when a signal was
/// actually sent. Idempotent.
pub fn stop_script(layout: &ContainerLayout) -> String {
    format!(
        r#"RUN_DIR='{run_dir}'
PID_FILE='{pid_file}'
killed=0
if [ -f "$PID_FILE" ]; then
  pid=$(cat "$PID_FILE" 2>/dev/null || true)
  if [ -n "$pid" ] && kill -0 "$pid" 2>/dev/null; then
    kill -TERM -- "-$pid" 2>/dev/null
    sleep 1
    kill -KILL -- "-$pid" 2>/dev/null
    killed=1
  fi
fi
rm -f "$PID_FILE" '{current}'
echo "STOPPED:$killed"
"#,
        run_dir = layout.run_dir(),
        pid_file = layout.pid_file(),
        current = layout.current_json(),
    )
}
