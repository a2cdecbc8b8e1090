//! Shared container-backend policy (§4.F): prohibited UID/GID enforcement, image env
//! injection, working-dir mirroring.

use anyhow::Result;
use kprov_core::prelude::*;
use std::collections::HashMap;

const DEFAULT_KERNEL_UID: &str = "1000";
const DEFAULT_KERNEL_GID: &str = "100";

pub fn apply_container_policy(
    kernel_id: &KernelId,
    env: &mut HashMap<String, String>,
    image_name: &str,
    executor_image_name: &str,
    mirror_working_dirs: bool,
    prohibited_uids: &std::collections::HashSet<String>,
    prohibited_gids: &std::collections::HashSet<String>,
) -> Result<()> {
    env.insert("KERNEL_IMAGE".to_string(), image_name.to_string());
    env.insert("KERNEL_EXECUTOR_IMAGE".to_string(), executor_image_name.to_string());

    if !mirror_working_dirs {
        env.remove("KERNEL_WORKING_DIR");
    }

    let kernel_uid = env.get("KERNEL_UID").cloned().unwrap_or_else(|| DEFAULT_KERNEL_UID.to_string());
    let kernel_gid = env.get("KERNEL_GID").cloned().unwrap_or_else(|| DEFAULT_KERNEL_GID.to_string());

    if prohibited_uids.contains(&kernel_uid) {
        return Err(ProvisionerError::permission_denied(
            kernel_id.clone(),
            None,
            format!("kernel's UID value of '{kernel_uid}' has been denied via prohibited_uids"),
        )
        .into());
    }
    if prohibited_gids.contains(&kernel_gid) {
        return Err(ProvisionerError::permission_denied(
            kernel_id.clone(),
            None,
            format!("kernel's GID value of '{kernel_gid}' has been denied via prohibited_gids"),
        )
        .into());
    }

    env.insert("KERNEL_UID".to_string(), kernel_uid);
    env.insert("KERNEL_GID".to_string(), kernel_gid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rejects_prohibited_uid_s2() {
        let mut env = HashMap::new();
        env.insert("KERNEL_UID".to_string(), "0".to_string());
        env.insert("KERNEL_GID".to_string(), "100".to_string());
        let prohibited_uids = HashSet::from(["0".to_string()]);
        let err = apply_container_policy(&"k1".to_string(), &mut env, "img", "img", false, &prohibited_uids, &HashSet::new())
            .unwrap_err();
        assert!(err.to_string().contains("UID"));
    }

    #[test]
    fn strips_working_dir_unless_mirroring() {
        let mut env = HashMap::new();
        env.insert("KERNEL_WORKING_DIR".to_string(), "/home/user".to_string());
        apply_container_policy(&"k1".to_string(), &mut env, "img", "img", false, &Default::default(), &Default::default()).unwrap();
        assert!(!env.contains_key("KERNEL_WORKING_DIR"));
    }

    #[test]
    fn defaults_uid_gid_when_absent() {
        let mut env = HashMap::new();
        apply_container_policy(&"k1".to_string(), &mut env, "img", "img", false, &Default::default(), &Default::default()).unwrap();
        assert_eq!(env.get("KERNEL_UID").unwrap(), DEFAULT_KERNEL_UID);
        assert_eq!(env.get("KERNEL_GID").unwrap(), DEFAULT_KERNEL_GID);
    }
}
