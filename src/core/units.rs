//! Catalog of common units
//!
//! Constructors for the facts most profiles assert: packages, files,
//! directories, mounts, repositories and services. Each one appends a fixed
//! suffix to `name` (`_installed`, `_created`, ...) so other units can refer
//! to it as a precondition without knowing how it was built.
//!
//! ```
//! use drnet::core::units;
//!
//! let nginx = units::installed("nginx", "", "nginx");
//! let site = units::file("nginx_site", "nginx_installed", "server {}", "/etc/nginx/sites-enabled/site");
//! assert_eq!(nginx.label(), "nginx_installed");
//! assert_eq!(site.precondition(), "nginx_installed");
//! ```

use crate::core::shell::{double_quoted, single_quoted};
use crate::core::unit::{Outcome, Unit};

/// A Debian package is installed.
pub fn installed(name: &str, precondition: &str, package: &str) -> Unit {
    Unit::new(
        &format!("{name}_installed"),
        precondition,
        format!("sudo DEBIAN_FRONTEND=noninteractive apt-get install --assume-yes {package}"),
        format!("dpkg-query --status {package} 2>&1 | grep \"Status:\""),
        "Status: install ok installed",
        Outcome::Pass,
        format!("Couldn't install {package}. This is pretty serious."),
    )
}

/// A systemd service is active.
pub fn running(name: &str, precondition: &str, service: &str) -> Unit {
    Unit::new(
        &format!("{name}_running"),
        precondition,
        format!("sudo systemctl restart {service}"),
        format!("systemctl is-active {service} 2>&1"),
        "active",
        Outcome::Pass,
        format!("I couldn't get {service} to run."),
    )
}

/// A file has exactly `text` as its content (plus a trailing newline).
///
/// The label is `name` itself, so the unit can be named after what the file
/// achieves.
pub fn file(name: &str, precondition: &str, text: &str, path: &str) -> Unit {
    file_with_message(
        name,
        precondition,
        text,
        path,
        &format!("I couldn't create {path}. Its contents are wrong or missing."),
    )
}

pub fn file_with_message(name: &str, precondition: &str, text: &str, path: &str, message: &str) -> Unit {
    let text = text.trim_end_matches('\n');
    let path_q = single_quoted(path);
    Unit::new(
        name,
        precondition,
        format!(
            "printf '%s\\n' {} | sudo tee {path_q} > /dev/null",
            single_quoted(text)
        ),
        format!("sudo cat {path_q} 2>/dev/null"),
        text,
        Outcome::Pass,
        message,
    )
}

/// A file contains `line`. Only for single-line text.
pub fn file_append(name: &str, precondition: &str, line: &str, path: &str) -> Unit {
    let path_q = single_quoted(path);
    let line_q = single_quoted(line);
    Unit::new(
        &format!("{name}_appended"),
        precondition,
        format!("printf '%s\\n' {line_q} | sudo tee -a {path_q} > /dev/null"),
        format!("sudo grep -qxF -- {line_q} {path_q} 2>/dev/null && echo pass || echo fail"),
        "pass",
        Outcome::Pass,
        format!("I couldn't append to {path}."),
    )
}

/// Every `needle` in a file is replaced with `replacement` (sed `s|..|..|g`).
pub fn file_edit(name: &str, precondition: &str, needle: &str, replacement: &str, path: &str) -> Unit {
    let path_q = single_quoted(path);
    Unit::new(
        &format!("{name}_edited"),
        precondition,
        format!(
            "sudo sed -i \"s|{}|{}|g\" {path_q}",
            double_quoted(needle),
            double_quoted(replacement)
        ),
        format!("sudo grep -F -- \"{}\" {path_q} 2>/dev/null", double_quoted(replacement)),
        "",
        Outcome::Fail,
        format!("Couldn't replace {needle} with {replacement} in file {path}"),
    )
}

/// A file has octal permissions `perms` (e.g. `750`).
pub fn file_perms(name: &str, precondition: &str, path: &str, perms: &str) -> Unit {
    file_perms_with_message(
        name,
        precondition,
        path,
        perms,
        &format!("I couldn't set the permissions of {path} to {perms}."),
    )
}

pub fn file_perms_with_message(
    name: &str,
    precondition: &str,
    path: &str,
    perms: &str,
    message: &str,
) -> Unit {
    let path_q = single_quoted(path);
    Unit::new(
        &format!("{name}_chmoded"),
        precondition,
        format!("sudo chmod {perms} {path_q}"),
        format!("sudo stat -c %a {path_q} 2>&1"),
        perms,
        Outcome::Pass,
        message,
    )
}

/// A file is owned by `owner`.
pub fn file_owner(name: &str, precondition: &str, path: &str, owner: &str) -> Unit {
    let path_q = single_quoted(path);
    Unit::new(
        &format!("{name}_chowned"),
        precondition,
        format!("sudo chown {owner} {path_q}"),
        format!("sudo stat -c %U {path_q} 2>&1"),
        owner,
        Outcome::Pass,
        format!("I couldn't change the owner of {path} to {owner}."),
    )
}

/// A directory exists.
pub fn dir(name: &str, precondition: &str, path: &str) -> Unit {
    let path_q = single_quoted(path);
    Unit::new(
        &format!("{name}_created"),
        precondition,
        format!("sudo mkdir -p {path_q}"),
        format!("sudo [ -d {path_q} ] && echo pass || echo fail"),
        "pass",
        Outcome::Pass,
        format!("Couldn't create {path}."),
    )
}

/// A mount point from `/etc/fstab` is mounted.
pub fn dir_mounted(name: &str, precondition: &str, path: &str) -> Unit {
    let path_q = single_quoted(path);
    Unit::new(
        &format!("{name}_mounted"),
        precondition,
        format!("sudo mount {path_q}"),
        format!("mount | grep -F -- {path_q}"),
        "",
        Outcome::Fail,
        format!("Couldn't mount {path}."),
    )
}

/// A git repository is cloned into `path`.
pub fn git_clone(name: &str, precondition: &str, url: &str, path: &str) -> Unit {
    let path_q = single_quoted(path);
    Unit::new(
        &format!("{name}_cloned"),
        precondition,
        format!(
            "sudo git config --global http.lowSpeedLimit 1000;\
             sudo git config --global http.lowSpeedTime 10;\
             sudo git clone {} {path_q}",
            single_quoted(url)
        ),
        format!("sudo [ -d {path_q}/.git ] && echo pass || echo fail"),
        "pass",
        Outcome::Pass,
        format!("Couldn't clone the repository {url}"),
    )
}
