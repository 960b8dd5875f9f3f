//! Synthetic build contexts for Git-sourced deployments.
//!
//! The context is a single generated `Dockerfile` that clones the
//! repository inside the build, so the engine needs no host-side checkout
//! and no ssh agent: anything the build needs it fetches itself.

use std::io;

use tar::{Builder, Header};

pub const DEFAULT_BASE_IMAGE: &str = "node:20-alpine";
pub const DEFAULT_BRANCH: &str = "main";
pub const DEFAULT_INSTALL_COMMAND: &str = "yarn install";
pub const DEFAULT_START_COMMAND: &str = "yarn start";

/// Everything the Dockerfile generator needs, carried in the worker's
/// typed message (build parameters are not part of the persisted desired
/// state).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitBuildSpec {
    pub git_url: String,
    pub branch: String,
    pub base_image: String,
    pub install_command: String,
    pub build_command: Option<String>,
    pub start_command: String,
}

impl GitBuildSpec {
    pub fn new(
        git_url: String,
        branch: Option<String>,
        base_image: Option<String>,
        install_command: Option<String>,
        build_command: Option<String>,
        start_command: Option<String>,
    ) -> Self {
        Self {
            git_url,
            branch: branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            base_image: base_image.unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
            install_command: install_command.unwrap_or_else(|| DEFAULT_INSTALL_COMMAND.to_string()),
            build_command,
            start_command: start_command.unwrap_or_else(|| DEFAULT_START_COMMAND.to_string()),
        }
    }
}

/// Render the Dockerfile for a build spec.
pub fn generate_dockerfile(spec: &GitBuildSpec) -> String {
    let alpine = spec.base_image.contains("alpine");

    let install_git = if alpine {
        "RUN apk add --no-cache git"
    } else {
        "RUN apt-get update && apt-get install -y git && rm -rf /var/lib/apt/lists/*"
    };

    let create_user = if alpine {
        "RUN addgroup -S appuser && adduser -S appuser -G appuser && chown -R appuser:appuser /app"
    } else {
        "RUN useradd --create-home --shell /bin/sh appuser && chown -R appuser:appuser /app"
    };

    let run_build = match spec.build_command.as_deref() {
        Some(build) => format!("RUN {} && {}", spec.install_command, build),
        None => format!("RUN {}", spec.install_command),
    };

    let cmd = argv_json(&spec.start_command);

    format!(
        "FROM {base}\n\
         \n\
         {install_git}\n\
         \n\
         WORKDIR /app\n\
         \n\
         RUN git clone --depth 1 --branch {branch} {url} .\n\
         \n\
         {run_build}\n\
         \n\
         {create_user}\n\
         \n\
         EXPOSE 3000\n\
         \n\
         USER appuser\n\
         \n\
         CMD {cmd}\n",
        base = spec.base_image,
        branch = spec.branch,
        url = spec.git_url,
    )
}

/// The exec-form `CMD` array for a shell-ish start command.
fn argv_json(command: &str) -> String {
    let argv: Vec<&str> = command.split_whitespace().collect();
    let argv = if argv.is_empty() {
        vec!["yarn", "start"]
    } else {
        argv
    };

    serde_json::to_string(&argv).expect("argv serializes")
}

/// Pack the Dockerfile into an in-memory tar stream for the engine's build
/// endpoint.
pub fn build_context(dockerfile: &str) -> io::Result<Vec<u8>> {
    let mut tar_data = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_data);

        let mut header = Header::new_gnu();
        header.set_path("Dockerfile")?;
        header.set_size(dockerfile.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, dockerfile.as_bytes())?;

        tar.finish()?;
    }

    Ok(tar_data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GitBuildSpec {
        GitBuildSpec::new(
            "https://github.com/acme/app.git".to_string(),
            None,
            None,
            None,
            None,
            None,
        )
    }

    #[test]
    fn alpine_base_uses_apk() {
        let dockerfile = generate_dockerfile(&spec());

        assert!(dockerfile.starts_with("FROM node:20-alpine\n"));
        assert!(dockerfile.contains("RUN apk add --no-cache git"));
        assert!(dockerfile.contains("addgroup -S appuser"));
        assert!(dockerfile.contains(
            "RUN git clone --depth 1 --branch main https://github.com/acme/app.git ."
        ));
        assert!(dockerfile.contains("EXPOSE 3000"));
        assert!(dockerfile.contains("USER appuser"));
        assert!(dockerfile.ends_with("CMD [\"yarn\",\"start\"]\n"));
    }

    #[test]
    fn debian_base_uses_apt() {
        let spec = GitBuildSpec::new(
            "https://github.com/acme/app.git".to_string(),
            Some("release".to_string()),
            Some("node:20-bookworm".to_string()),
            Some("npm ci".to_string()),
            Some("npm run build".to_string()),
            Some("node dist/server.js".to_string()),
        );
        let dockerfile = generate_dockerfile(&spec);

        assert!(dockerfile.contains("apt-get install -y git"));
        assert!(dockerfile.contains("useradd --create-home"));
        assert!(dockerfile.contains("--branch release"));
        assert!(dockerfile.contains("RUN npm ci && npm run build"));
        assert!(dockerfile.ends_with("CMD [\"node\",\"dist/server.js\"]\n"));
    }

    #[test]
    fn empty_start_command_falls_back_to_yarn() {
        assert_eq!(argv_json("   "), r#"["yarn","start"]"#);
    }

    #[test]
    fn context_is_a_single_file_tar() {
        let dockerfile = generate_dockerfile(&spec());
        let context = build_context(&dockerfile).unwrap();

        let mut archive = tar::Archive::new(context.as_slice());
        let entries: Vec<_> = archive.entries().unwrap().collect();
        assert_eq!(entries.len(), 1);
        let entry = entries.into_iter().next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("Dockerfile"));
        assert_eq!(entry.size(), dockerfile.len() as u64);
    }
}
