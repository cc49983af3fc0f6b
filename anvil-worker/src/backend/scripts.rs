//! Shell script helpers shared by every backend
//!
//! Backends never build command lines by hand; they call these free
//! functions so the three implementations agree on paths and quoting.

/// File the setup phase fetches from the bootstrap server
pub const BOOTSTRAP_ARCHIVE: &str = "do_things.tar";

/// Directory layout of a build on its backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    prefix: String,
}

impl Workspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    /// Where bootstrap scripts are unpacked
    pub fn anvil_dir(&self) -> String {
        format!("{}/.anvil", self.prefix)
    }

    /// Where the build's codebase is checked out
    pub fn clone_dir(&self, build_id: &str) -> String {
        format!("{}/{}", self.prefix, build_id)
    }

    /// Where integrations write a build's credential files
    pub fn secrets_dir(&self, build_id: &str) -> String {
        format!("{}/.anvil/secrets/{}", self.prefix, build_id)
    }

    /// Where staged binaries are placed
    pub fn bin_dir(&self) -> String {
        format!("{}/.anvil/bin", self.prefix)
    }
}

/// Joins a command list into one `&&` chain
pub fn join_commands(cmds: &[String]) -> String {
    cmds.join(" && ")
}

/// Normalizes a command list into an argv for `/bin/sh -c`
pub fn shell_argv(cmds: &[String]) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), join_commands(cmds)]
}

/// Prefixes a command list with a change into `dir`
pub fn cd_and_run(dir: &str, cmds: &[String]) -> Vec<String> {
    let mut all = Vec::with_capacity(cmds.len() + 1);
    all.push(format!("cd {}", shell_quote(dir)));
    all.extend(cmds.iter().cloned());
    all
}

/// Quotes a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Splits `NAME=value` assignments, dropping malformed entries
pub fn parse_env(vars: &[String]) -> Vec<(String, String)> {
    vars.iter()
        .filter_map(|var| {
            let (name, value) = var.split_once('=')?;
            (!name.is_empty()).then(|| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn fetch(url: &str, dest: &str) -> String {
    format!(
        "(wget -q -O {dest} {url} || curl -fsSL -o {dest} {url})",
        dest = shell_quote(dest),
        url = shell_quote(url)
    )
}

/// Fetches and unpacks the bootstrap archive into `anvil_dir`
pub fn download_bootstrap(loopback_ip: &str, port: u16, anvil_dir: &str) -> Vec<String> {
    let url = format!("http://{}:{}/{}", loopback_ip, port, BOOTSTRAP_ARCHIVE);
    vec![
        format!("mkdir -p {}", shell_quote(anvil_dir)),
        format!("cd {}", shell_quote(anvil_dir)),
        fetch(&url, BOOTSTRAP_ARCHIVE),
        format!("tar -xf {}", BOOTSTRAP_ARCHIVE),
        format!("rm {}", BOOTSTRAP_ARCHIVE),
        "chmod -R +x .".to_string(),
    ]
}

/// Clones the codebase into `clone_dir` and checks out `revision`
pub fn download_codebase(clone_url: &str, revision: &str, clone_dir: &str) -> Vec<String> {
    vec![
        format!("rm -rf {}", shell_quote(clone_dir)),
        format!(
            "git clone --quiet {} {}",
            shell_quote(clone_url),
            shell_quote(clone_dir)
        ),
        format!("cd {}", shell_quote(clone_dir)),
        format!("git checkout --quiet {}", shell_quote(revision)),
    ]
}

/// Stages one binary from the bootstrap server into `bin_dir`
pub fn download_binary(loopback_ip: &str, port: u16, name: &str, bin_dir: &str) -> Vec<String> {
    let url = format!("http://{}:{}/{}", loopback_ip, port, name);
    let dest = format!("{}/{}", bin_dir, name);
    vec![
        format!("mkdir -p {}", shell_quote(bin_dir)),
        fetch(&url, &dest),
        format!("chmod +x {}", shell_quote(&dest)),
    ]
}

/// Label prepended to every output line of a stage
pub fn stage_label(stage: &str) -> String {
    format!("{} | ", stage.to_uppercase())
}
