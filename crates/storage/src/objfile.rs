// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-object state files.
//!
//! Each job, queue, and resource persists to its own text file of
//! `KEY value` lines. String values escape embedded newlines and
//! backslashes; repeated values use indexed keys (`ARGV[0]`, `ARGV[1]`).
//! Files are written to a `.new` temp name, fsynced, then renamed.

use gq_core::{
    InternalFlags, Job, JobId, JobState, Queue, QueueFlags, QueueStats, Resource, ResourceRequest,
    Rusage,
};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Jobs are sharded into subdirectories of this many ids each.
const JOB_DIR_FACTOR: u32 = 10_000;

/// Errors reading or writing object state files.
#[derive(Debug, Error)]
pub enum ObjFileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

fn malformed(path: &Path, message: impl Into<String>) -> ObjFileError {
    ObjFileError::Malformed {
        path: path.to_owned(),
        message: message.into(),
    }
}

/// Escape `\` and newline so a value occupies a single line.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`]. Unrecognized escapes pass through unchanged.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split a line into `(key, index, value)`. Comments and blank lines
/// return `None`. The value is unescaped.
fn parse_line(line: &str) -> Option<(String, Option<usize>, String)> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (key, value) = match line.split_once(char::is_whitespace) {
        Some((k, v)) => (k.trim(), v.trim()),
        None => (line, ""),
    };

    let (key, index) = match key.split_once('[') {
        Some((base, rest)) => {
            let index = rest.strip_suffix(']').and_then(|n| n.parse().ok());
            (base, index)
        }
        None => (key, None),
    };

    Some((key.to_string(), index, unescape(value)))
}

/// Write `lines` to `<path>.new`, fsync, and rename into place.
fn write_atomic(path: &Path, contents: &str) -> Result<(), ObjFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("new");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn job_path(state_dir: &Path, jobid: JobId) -> PathBuf {
    state_dir
        .join("jobs")
        .join((jobid / JOB_DIR_FACTOR).to_string())
        .join(format!("{jobid}.job"))
}

pub fn queue_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("queues").join(format!("{name}.queue"))
}

pub fn resource_path(state_dir: &Path, name: &str) -> PathBuf {
    state_dir.join("resources").join(format!("{name}.resource"))
}

/// Remove an object file, ignoring files already gone.
pub fn remove_object(path: &Path) -> Result<(), ObjFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn save_job(state_dir: &Path, job: &Job) -> Result<(), ObjFileError> {
    let mut out = String::new();
    let mut kv = |key: &str, value: &str| {
        let _ = writeln!(out, "{key} {}", escape(value));
    };

    kv("JOBNAME", &job.name);
    kv("QUEUENAME", &job.queue);
    kv("SUBMITTER", &job.submitter_uid.to_string());
    kv("UID", &job.run_uid.to_string());
    kv("SUBMITTIME", &job.submit_time.to_string());
    kv("ARGC", &job.args.len().to_string());
    for (i, arg) in job.args.iter().enumerate() {
        kv(&format!("ARGV[{i}]"), arg);
    }
    if !job.env.is_empty() {
        kv("ENVC", &job.env.len().to_string());
        for (i, env) in job.env.iter().enumerate() {
            kv(&format!("ENV[{i}]"), env);
        }
    }
    if let Some(shell) = &job.shell {
        kv("SHELL", shell);
    }
    if let Some(pre) = &job.pre_cmd {
        kv("PRECMD", pre);
    }
    if let Some(post) = &job.post_cmd {
        kv("POSTCMD", post);
    }
    if let Some(stdout) = &job.stdout {
        kv("STDOUT", stdout);
    }
    if let Some(stderr) = &job.stderr {
        kv("STDERR", stderr);
    }
    if job.nice != 0 {
        kv("NICE", &job.nice.to_string());
    }
    kv("STATE", &job.state.bits().to_string());
    kv("PRIORITY", &job.priority.to_string());
    if job.defer_time != 0 {
        kv("DEFERTIME", &job.defer_time.to_string());
    }
    if job.start_time != 0 {
        kv("STARTTIME", &job.start_time.to_string());
    }
    if job.finish_time != 0 {
        kv("FINISHTIME", &job.finish_time.to_string());
    }
    if job.exit_code != 0 {
        kv("EXITCODE", &job.exit_code.to_string());
    }
    if job.signal != 0 {
        kv("SIGNAL", &job.signal.to_string());
    }
    if job.fail_reason != 0 {
        kv("FAILREASON", &job.fail_reason.to_string());
    }
    if !job.tags.is_empty() {
        for (i, (key, value)) in job.tags.iter().enumerate() {
            kv(&format!("TAG[{i}]"), &format!("{key}={value}"));
        }
    }
    if !job.resources.is_empty() {
        for (i, req) in job.resources.iter().enumerate() {
            kv(&format!("RES[{i}]"), &req.to_string());
        }
    }
    if job.rusage != Rusage::default() {
        let u = &job.rusage;
        kv("UTIME_SEC", &u.utime_sec.to_string());
        kv("UTIME_USEC", &u.utime_usec.to_string());
        kv("STIME_SEC", &u.stime_sec.to_string());
        kv("STIME_USEC", &u.stime_usec.to_string());
        kv("MAXRSS", &u.maxrss.to_string());
        kv("MINFLT", &u.minflt.to_string());
        kv("MAJFLT", &u.majflt.to_string());
        kv("INBLOCK", &u.inblock.to_string());
        kv("OUBLOCK", &u.oublock.to_string());
        kv("NVCSW", &u.nvcsw.to_string());
        kv("NIVCSW", &u.nivcsw.to_string());
    }
    kv("REVISION", &job.revision.to_string());

    write_atomic(&job_path(state_dir, job.jobid), &out)
}

fn parse_num<T: std::str::FromStr>(
    path: &Path,
    key: &str,
    value: &str,
) -> Result<T, ObjFileError> {
    value
        .parse()
        .map_err(|_| malformed(path, format!("bad numeric value for {key}: {value:?}")))
}

/// Load a job from its state file. The jobid is derived from the filename.
pub fn load_job(path: &Path) -> Result<Job, ObjFileError> {
    let jobid: JobId = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed(path, "cannot derive jobid from filename"))?;

    let contents = fs::read_to_string(path)?;

    let mut name = None;
    let mut queue = None;
    let mut submitter_uid = 0;
    let mut run_uid = 0;
    let mut submit_time = 0;
    let mut args: Vec<String> = Vec::new();
    let mut env: Vec<String> = Vec::new();
    let mut shell = None;
    let mut pre_cmd = None;
    let mut post_cmd = None;
    let mut stdout = None;
    let mut stderr = None;
    let mut nice = 0;
    let mut state = None;
    let mut priority = 0u8;
    let mut defer_time = 0;
    let mut start_time = 0;
    let mut finish_time = 0;
    let mut exit_code = 0;
    let mut signal = 0;
    let mut fail_reason = 0;
    let mut tags = BTreeMap::new();
    let mut resources = Vec::new();
    let mut rusage = Rusage::default();
    let mut revision = 0;

    let set_indexed = |vec: &mut Vec<String>, index: Option<usize>, value: String| {
        let index = index.unwrap_or(vec.len());
        if index >= vec.len() {
            vec.resize(index + 1, String::new());
        }
        vec[index] = value;
    };

    for line in contents.lines() {
        let Some((key, index, value)) = parse_line(line) else {
            continue;
        };
        match key.as_str() {
            "JOBNAME" => name = Some(value),
            "QUEUENAME" => queue = Some(value),
            "SUBMITTER" => submitter_uid = parse_num(path, &key, &value)?,
            "UID" => run_uid = parse_num(path, &key, &value)?,
            "SUBMITTIME" => submit_time = parse_num(path, &key, &value)?,
            "ARGC" | "ENVC" => {}
            "ARGV" => set_indexed(&mut args, index, value),
            "ENV" => set_indexed(&mut env, index, value),
            "SHELL" => shell = Some(value),
            "PRECMD" => pre_cmd = Some(value),
            "POSTCMD" => post_cmd = Some(value),
            "STDOUT" => stdout = Some(value),
            "STDERR" => stderr = Some(value),
            "NICE" => nice = parse_num(path, &key, &value)?,
            "STATE" => {
                let bits: u32 = parse_num(path, &key, &value)?;
                state = Some(
                    JobState::from_bits(bits)
                        .ok_or_else(|| malformed(path, format!("invalid STATE value {bits}")))?,
                );
            }
            "PRIORITY" => priority = parse_num(path, &key, &value)?,
            "DEFERTIME" => defer_time = parse_num(path, &key, &value)?,
            "STARTTIME" => start_time = parse_num(path, &key, &value)?,
            "FINISHTIME" => finish_time = parse_num(path, &key, &value)?,
            "EXITCODE" => exit_code = parse_num(path, &key, &value)?,
            "SIGNAL" => signal = parse_num(path, &key, &value)?,
            "FAILREASON" => fail_reason = parse_num(path, &key, &value)?,
            "TAG" => {
                let (k, v) = value.split_once('=').unwrap_or((value.as_str(), ""));
                tags.insert(k.to_string(), v.to_string());
            }
            "RES" => {
                let req = ResourceRequest::parse(&value)
                    .ok_or_else(|| malformed(path, format!("invalid RES value {value:?}")))?;
                resources.push(req);
            }
            "UTIME_SEC" => rusage.utime_sec = parse_num(path, &key, &value)?,
            "UTIME_USEC" => rusage.utime_usec = parse_num(path, &key, &value)?,
            "STIME_SEC" => rusage.stime_sec = parse_num(path, &key, &value)?,
            "STIME_USEC" => rusage.stime_usec = parse_num(path, &key, &value)?,
            "MAXRSS" => rusage.maxrss = parse_num(path, &key, &value)?,
            "MINFLT" => rusage.minflt = parse_num(path, &key, &value)?,
            "MAJFLT" => rusage.majflt = parse_num(path, &key, &value)?,
            "INBLOCK" => rusage.inblock = parse_num(path, &key, &value)?,
            "OUBLOCK" => rusage.oublock = parse_num(path, &key, &value)?,
            "NVCSW" => rusage.nvcsw = parse_num(path, &key, &value)?,
            "NIVCSW" => rusage.nivcsw = parse_num(path, &key, &value)?,
            "REVISION" => revision = parse_num(path, &key, &value)?,
            other => {
                warn!(path = %path.display(), key = other, "skipping unknown job file key");
            }
        }
    }

    // Persisted state is restored verbatim, never defaulted.
    let state = state.ok_or_else(|| malformed(path, "missing STATE"))?;

    Ok(Job {
        jobid,
        name: name.ok_or_else(|| malformed(path, "missing JOBNAME"))?,
        queue: queue.ok_or_else(|| malformed(path, "missing QUEUENAME"))?,
        submitter_uid,
        run_uid,
        shell,
        pre_cmd,
        post_cmd,
        args,
        env,
        stdout,
        stderr,
        nice,
        priority,
        state,
        internal: InternalFlags::default(),
        pend_reason: None,
        fail_reason,
        exit_code,
        signal,
        submit_time,
        defer_time,
        start_time,
        finish_time,
        tags,
        resources,
        pid: 0,
        rusage,
        revision,
        dirty: false,
    })
}

pub fn save_queue(state_dir: &Path, queue: &Queue) -> Result<(), ObjFileError> {
    let mut out = String::new();
    let mut kv = |key: &str, value: &str| {
        let _ = writeln!(out, "{key} {}", escape(value));
    };

    kv("DESC", &queue.description);
    kv("HOST", &queue.host);
    kv("JOBLIMIT", &queue.job_limit.to_string());
    kv("PRIORITY", &queue.priority.to_string());
    kv("OPEN", if queue.is_open() { "1" } else { "0" });
    if queue.default_queue {
        kv("DEFAULT", "1");
    }
    kv("REVISION", &queue.revision.to_string());

    write_atomic(&queue_path(state_dir, &queue.name), &out)
}

/// Load a queue from its state file. The name is derived from the filename.
/// The Started flag is always clear at load: no agent is connected yet.
pub fn load_queue(path: &Path) -> Result<Queue, ObjFileError> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| malformed(path, "cannot derive queue name from filename"))?
        .to_string();

    let contents = fs::read_to_string(path)?;

    let mut queue = Queue {
        name,
        description: String::new(),
        host: String::new(),
        agent: None,
        job_limit: gq_core::queue::DEFAULT_QUEUE_LIMIT,
        priority: gq_core::queue::DEFAULT_QUEUE_PRIORITY,
        flags: QueueFlags::default(),
        default_queue: false,
        permissions: HashMap::new(),
        stats: QueueStats::default(),
        active_count: 0,
        pending_start: 0,
        internal: InternalFlags::default(),
        revision: 0,
        dirty: false,
    };

    for line in contents.lines() {
        let Some((key, _, value)) = parse_line(line) else {
            continue;
        };
        match key.as_str() {
            "DESC" => queue.description = value,
            "HOST" => queue.host = value,
            "JOBLIMIT" => queue.job_limit = parse_num(path, &key, &value)?,
            "PRIORITY" => queue.priority = parse_num(path, &key, &value)?,
            "OPEN" => {
                let open: u8 = parse_num(path, &key, &value)?;
                if open == 0 {
                    queue.flags.remove(QueueFlags::OPEN);
                }
            }
            "DEFAULT" => queue.default_queue = value != "0",
            "REVISION" => queue.revision = parse_num(path, &key, &value)?,
            other => {
                warn!(path = %path.display(), key = other, "skipping unknown queue file key");
            }
        }
    }

    if queue.host.is_empty() {
        return Err(malformed(path, "missing HOST"));
    }

    Ok(queue)
}

pub fn save_resource(state_dir: &Path, resource: &Resource) -> Result<(), ObjFileError> {
    let mut out = String::new();
    let _ = writeln!(out, "COUNT {}", resource.count);
    let _ = writeln!(out, "REVISION {}", resource.revision);
    write_atomic(&resource_path(state_dir, &resource.name), &out)
}

/// Load a resource from its state file. `in_use` starts at zero; agents
/// re-derive it during reconciliation.
pub fn load_resource(path: &Path) -> Result<Resource, ObjFileError> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| malformed(path, "cannot derive resource name from filename"))?
        .to_string();

    let contents = fs::read_to_string(path)?;

    let mut resource = Resource {
        name,
        count: 0,
        in_use: 0,
        internal: InternalFlags::default(),
        revision: 0,
        dirty: false,
    };

    for line in contents.lines() {
        let Some((key, _, value)) = parse_line(line) else {
            continue;
        };
        match key.as_str() {
            "COUNT" => resource.count = parse_num(path, &key, &value)?,
            "REVISION" => resource.revision = parse_num(path, &key, &value)?,
            other => {
                warn!(path = %path.display(), key = other, "skipping unknown resource file key");
            }
        }
    }

    Ok(resource)
}

#[cfg(test)]
#[path = "objfile_tests.rs"]
mod tests;
