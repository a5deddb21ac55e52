use super::{BLOCKED_MARKER, NEEDS_HUMAN_MARKER};

/// Review findings are reported one per line with this prefix.
pub const FINDING_MARKER: &str = "FINDING:";

fn markers() -> String {
    format!(
        "If you cannot make progress, print a line starting with `{BLOCKED_MARKER}` and the reason.\n\
         If a decision needs a person, print a line starting with `{NEEDS_HUMAN_MARKER}` and the question."
    )
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn implement(task: &str, findings: &[String]) -> String {
    let mut prompt = format!("Implement the following task in this repository.\n\n## Task\n\n{task}\n");
    if !findings.is_empty() {
        prompt.push_str(&format!(
            "\n## Open review findings\n\nA previous attempt was reviewed. Address these as well:\n\n{}\n",
            bullet_list(findings)
        ));
    }
    prompt.push_str(&format!(
        "\nMake the change, keep the build and tests passing, and summarise what you did.\n{}\n",
        markers()
    ));
    prompt
}

pub fn review(task: &str, summary: Option<&str>) -> String {
    let mut prompt = format!(
        "Review the uncommitted changes in this repository, made for the task below.\n\n## Task\n\n{task}\n"
    );
    if let Some(summary) = summary.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\n## Implementer's summary\n\n{summary}\n"));
    }
    prompt.push_str(&format!(
        "\nDo not modify any files. Report each problem worth fixing on its own line as\n\
         `{FINDING_MARKER} <description>`. If there are none, say so without using the prefix.\n"
    ));
    prompt
}

pub fn fix(task: &str, findings: &[String]) -> String {
    format!(
        "Fix the following review findings for the task `{task}`.\n\n## Findings\n\n{}\n\n\
         Change only what is needed and keep the build and tests passing.\n{}\n",
        bullet_list(findings),
        markers()
    )
}

pub fn pr(task: &str, branch: Option<&str>) -> String {
    let branch = match branch {
        Some(b) => format!("Push the work to the branch `{b}`"),
        None => "Push the work to the current branch".to_string(),
    };
    format!(
        "Commit all changes for the task below. {branch} and open a GitHub pull request \
         with a short description.\n\n## Task\n\n{task}\n\n\
         Print the pull request URL on its own line when done.\n{}\n",
        markers()
    )
}
