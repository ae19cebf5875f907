//! Per-category argv/env preparation.
//!
//! The control daemon ships the job environment inside the request; the
//! worker supplements it per category before spawning. Power scripts get a
//! deliberately minimal environment: cluster name and job id, nothing
//! else. Burst-buffer scripts additionally receive the forwarded
//! side-channel payload through a temp file whose path is exported in the
//! environment; the file is removed when the run finishes.

use std::io::{self, Write};

use crate::wire::protocol::{ScriptCategory, ScriptRequest};

pub const ENV_SCRIPT_CONTEXT: &str = "SLURM_SCRIPT_CONTEXT";
pub const ENV_CLUSTER_NAME: &str = "SLURM_CLUSTER_NAME";
pub const ENV_JOB_ID: &str = "SLURM_JOB_ID";
pub const ENV_BB_DATA_FILE: &str = "SLURM_BB_DATA_FILE";

/// Fully prepared invocation for one script.
///
/// Holds the side-channel temp file (if any) alive for the duration of the
/// run; dropping this removes it.
pub struct PreparedScript {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    sidecar: Option<tempfile::TempPath>,
}

impl PreparedScript {
    #[cfg(test)]
    fn sidecar_path(&self) -> Option<&std::path::Path> {
        self.sidecar.as_deref()
    }
}

/// Build the argv/env the script will actually see.
pub fn prepare(request: &ScriptRequest, cluster_name: &str) -> io::Result<PreparedScript> {
    let argv = request.argv.clone();

    if request.category == ScriptCategory::Power {
        // Minimal on purpose: power scripts run while node state is in
        // flux and must not depend on job environment.
        let env = vec![
            (ENV_CLUSTER_NAME.to_string(), cluster_name.to_string()),
            (ENV_JOB_ID.to_string(), request.job_id.to_string()),
        ];
        return Ok(PreparedScript {
            argv,
            env,
            sidecar: None,
        });
    }

    let mut env = request.env.clone();
    env.push((
        ENV_SCRIPT_CONTEXT.to_string(),
        request.category.context().to_string(),
    ));
    env.push((ENV_CLUSTER_NAME.to_string(), cluster_name.to_string()));
    env.push((ENV_JOB_ID.to_string(), request.job_id.to_string()));

    let mut sidecar = None;
    if request.category == ScriptCategory::BbLua
        && let Some(extra) = &request.extra
    {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(extra)?;
        file.flush()?;
        let path = file.into_temp_path();
        tracing::debug!(
            target: "scriptd::bb",
            job_id = request.job_id,
            path = %path.display(),
            bytes = extra.len(),
            "Wrote burst-buffer payload file"
        );
        env.push((ENV_BB_DATA_FILE.to_string(), path.display().to_string()));
        sidecar = Some(path);
    }

    Ok(PreparedScript { argv, env, sidecar })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request(category: ScriptCategory) -> ScriptRequest {
        ScriptRequest {
            job_id: 42,
            name: "test".to_string(),
            category,
            path: PathBuf::from("/bin/true"),
            argv: vec!["arg1".to_string()],
            env: vec![("SLURM_JOB_UID".to_string(), "1000".to_string())],
            timeout_secs: None,
            extra: None,
        }
    }

    fn env_get<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn power_env_is_cluster_and_job_only() {
        let prepared = prepare(&request(ScriptCategory::Power), "tux").unwrap();
        assert_eq!(prepared.env.len(), 2);
        assert_eq!(env_get(&prepared.env, ENV_CLUSTER_NAME), Some("tux"));
        assert_eq!(env_get(&prepared.env, ENV_JOB_ID), Some("42"));
        assert_eq!(env_get(&prepared.env, ENV_SCRIPT_CONTEXT), None);
    }

    #[test]
    fn prolog_env_carries_request_env_plus_context() {
        let prepared = prepare(&request(ScriptCategory::Prolog), "tux").unwrap();
        assert_eq!(env_get(&prepared.env, "SLURM_JOB_UID"), Some("1000"));
        assert_eq!(
            env_get(&prepared.env, ENV_SCRIPT_CONTEXT),
            Some("prolog_slurmctld")
        );
        assert_eq!(env_get(&prepared.env, ENV_JOB_ID), Some("42"));
        assert_eq!(prepared.argv, vec!["arg1".to_string()]);
    }

    #[test]
    fn bb_payload_lands_in_a_sidecar_file() {
        let mut req = request(ScriptCategory::BbLua);
        req.extra = Some(b"{\"pool\":\"fast\"}".to_vec());

        let prepared = prepare(&req, "tux").unwrap();
        let path = prepared.sidecar_path().expect("sidecar file").to_path_buf();
        assert_eq!(
            env_get(&prepared.env, ENV_BB_DATA_FILE),
            Some(path.display().to_string().as_str())
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"pool\":\"fast\"}");

        drop(prepared);
        assert!(!path.exists(), "sidecar should be removed after the run");
    }

    #[test]
    fn bb_without_payload_has_no_sidecar() {
        let prepared = prepare(&request(ScriptCategory::BbLua), "tux").unwrap();
        assert!(prepared.sidecar_path().is_none());
        assert_eq!(env_get(&prepared.env, ENV_BB_DATA_FILE), None);
    }
}
