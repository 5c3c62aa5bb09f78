/// Fixed argv policy applied before any options frame is sent (§4.6 "mount-arg policy"). Strips
/// args a shared mounter pod must not let workloads override, and injects the ones the driver
/// itself controls.
const DISALLOWED_PREFIXES: &[&str] = &[
    "--endpoint-url",
    "--profile",
    "--cache-xz",
    "--incremental-upload",
];

/// Filters disallowed argv and appends driver-mandated argv (credentials file path, shared-mode
/// marker). `credentials_file_path` is the path inside the mounter pod the agent will have
/// written the resolved credentials to (C4, §4.4).
pub fn apply_policy(requested_args: &[String], credentials_file_path: &str) -> Vec<String> {
    let mut filtered: Vec<String> = requested_args
        .iter()
        .filter(|arg| !DISALLOWED_PREFIXES.iter().any(|p| arg.starts_with(p)))
        .cloned()
        .collect();

    filtered.push(format!("--credentials-file={credentials_file_path}"));
    filtered.push("--pod-shared-mode".to_owned());
    filtered
}

/// Appends FSGroup-related argv (§4.6 step 9) unless the caller already supplied them.
pub fn apply_fs_group(mut args: Vec<String>, fs_group: &str) -> Vec<String> {
    if fs_group.is_empty() {
        return args;
    }
    if !args.iter().any(|a| a.starts_with("--gid")) {
        args.push(format!("--gid={fs_group}"));
    }
    if !args.iter().any(|a| a == "--allow-other") {
        args.push("--allow-other".to_owned());
    }
    if !args.iter().any(|a| a.starts_with("--file-mode")) {
        args.push("--file-mode=0644".to_owned());
    }
    if !args.iter().any(|a| a.starts_with("--dir-mode")) {
        args.push("--dir-mode=0755".to_owned());
    }
    args
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_disallowed_args() {
        let requested = vec!["--endpoint-url=http://evil".to_owned(), "--read-only".to_owned()];
        let out = apply_policy(&requested, "/tmp/creds");
        assert!(!out.iter().any(|a| a.starts_with("--endpoint-url")));
        assert!(out.contains(&"--read-only".to_owned()));
    }

    #[test]
    fn always_injects_credentials_path_and_shared_mode() {
        let out = apply_policy(&[], "/tmp/creds");
        assert!(out.contains(&"--credentials-file=/tmp/creds".to_owned()));
        assert!(out.contains(&"--pod-shared-mode".to_owned()));
    }

    #[test]
    fn fs_group_noop_when_unset() {
        let out = apply_fs_group(vec!["--read-only".to_owned()], "");
        assert_eq!(out, vec!["--read-only".to_owned()]);
    }

    #[test]
    fn fs_group_injects_gid_and_allow_other() {
        let out = apply_fs_group(vec![], "1000");
        assert!(out.contains(&"--gid=1000".to_owned()));
        assert!(out.contains(&"--allow-other".to_owned()));
    }

    #[test]
    fn fs_group_does_not_override_user_supplied_gid() {
        let out = apply_fs_group(vec!["--gid=2000".to_owned()], "1000");
        assert_eq!(out.iter().filter(|a| a.starts_with("--gid")).count(), 1);
        assert!(out.contains(&"--gid=2000".to_owned()));
    }
}
