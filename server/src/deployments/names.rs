//! Deterministic naming of every Docker resource this process creates.
//!
//! All derivations stay within Docker's 63-byte name limit by construction:
//! environment names are capped at 32 characters and job ids are 16.

/// `overlay_env_{name}_{epoch_ms}` -- globally unique even across rapid
/// recreations of the same logical name.
pub fn overlay_name(env_name: &str, epoch_ms: i64) -> String {
    format!("overlay_env_{env_name}_{epoch_ms}")
}

/// `job_{env_name}_{job_id}`
pub fn service_name(env_name: &str, job_id: &str) -> String {
    format!("job_{env_name}_{job_id}")
}

/// `vol_{env_name}_{logical_name}`
pub fn volume_name(env_name: &str, logical_name: &str) -> String {
    format!("vol_{env_name}_{logical_name}")
}

/// `img_{lowercase(env_name)}_{epoch_s}`
pub fn image_name(env_name: &str, epoch_s: i64) -> String {
    format!("img_{}_{epoch_s}", env_name.to_lowercase())
}

/// Git-sourced images are tagged with their branch.
pub fn image_tag(branch: Option<&str>) -> String {
    branch.unwrap_or("latest").to_string()
}

#[cfg(test)]
mod tests {
    use runway_common::models::environment::MAX_ENV_NAME_LENGTH;
    use runway_common::JOB_ID_LENGTH;

    use super::*;

    #[test]
    fn service_names_fit_docker_limit_by_construction() {
        let env_name = "E".repeat(MAX_ENV_NAME_LENGTH);
        let job_id = "j".repeat(JOB_ID_LENGTH);
        assert!(service_name(&env_name, &job_id).len() <= 63);
    }

    #[test]
    fn derivations_are_deterministic() {
        assert_eq!(service_name("demo", "abcdefghijklmnop"), "job_demo_abcdefghijklmnop");
        assert_eq!(volume_name("demo", "data"), "vol_demo_data");
        assert_eq!(overlay_name("demo", 1700000000000), "overlay_env_demo_1700000000000");
    }

    #[test]
    fn image_names_are_lowercased() {
        assert_eq!(image_name("MyApp", 1700000000), "img_myapp_1700000000");
        assert_eq!(image_tag(Some("main")), "main");
        assert_eq!(image_tag(None), "latest");
    }
}
