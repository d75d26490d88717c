// Task Script Generation
// Turns a job's task list into the shell script stored in its credential carrier

/// Generate the script for `tasks` run by `shell`.
///
/// `/bin/sh` scripts get `set -e` and `/bin/bash` scripts get `set -eo pipefail`;
/// other shells get no preamble.
pub fn generate_script(shell: &str, tasks: &[String]) -> String {
    let mut script = format!("#!{}\n\n", shell);

    match shell {
        "/bin/sh" => script.push_str("set -e\n\n"),
        "/bin/bash" => script.push_str("set -eo pipefail\n\n"),
        _ => {}
    }

    script.push_str(&tasks.join("\n"));
    script
}
