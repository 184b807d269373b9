//! Instruction payload and argument templating for backend stages.

use super::StageJob;

/// Longest previous-failure excerpt included in a retry payload.
pub const MAX_RETRY_CONTEXT_CHARS: usize = 1000;

/// Substitute `{max_turns}`, `{task_name}`, `{stage}`, `{artifact_dir}` and `{attempt}`.
pub fn substitute_args(args: &[String], job: &StageJob, max_turns: u32) -> Vec<String> {
    let artifact_dir = job.artifact_dir.to_string_lossy();
    args.iter()
        .map(|arg| {
            arg.replace("{max_turns}", &max_turns.to_string())
                .replace("{task_name}", &job.task_name)
                .replace("{stage}", &job.stage.name)
                .replace("{artifact_dir}", &artifact_dir)
                .replace("{attempt}", &job.attempt.to_string())
        })
        .collect()
}

/// Truncate to the first `max_chars` characters, marking the cut.
pub fn truncate_head(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}\n...(truncated)", head)
}

/// Build the instruction payload written to the backend's stdin.
pub fn compile_payload(job: &StageJob, read_only: bool) -> String {
    let mut out = String::new();

    out.push_str(&format!("# Stage: {}\n\n", job.stage.name));
    out.push_str(&format!("Task: {}\n", job.task_name));
    out.push_str(&format!("Task type: {}\n", job.task_type));
    out.push_str(&format!(
        "Artifact directory: {}\n",
        job.artifact_dir.display()
    ));
    if !job.task_description.trim().is_empty() {
        out.push_str(&format!("\n## Description\n{}\n", job.task_description.trim()));
    }

    if !job.available_artifacts.is_empty() {
        out.push_str("\n## Artifacts from earlier stages\n");
        for name in &job.available_artifacts {
            out.push_str(&format!("- {}\n", name));
        }
    }

    let mut expected: Vec<&str> = job
        .validation
        .required_artifacts
        .iter()
        .map(String::as_str)
        .collect();
    if let Some(ref artifact) = job.validation.artifact
        && !expected.contains(&artifact.as_str())
    {
        expected.push(artifact);
    }
    if !expected.is_empty() {
        out.push_str("\n## Artifacts this stage must produce\n");
        for name in expected {
            out.push_str(&format!("- {}\n", name));
        }
    }

    let markers: Vec<String> = [
        ("pass", &job.validation.pass_marker),
        ("fail", &job.validation.fail_marker),
        ("minor changes", &job.validation.minor_marker),
    ]
    .iter()
    .filter_map(|(label, m)| m.as_ref().map(|m| format!("- {}: `{}`", label, m)))
    .collect();
    if !markers.is_empty() {
        out.push_str("\n## Verdict\nEnd your report with exactly one of these markers:\n");
        for line in markers {
            out.push_str(&line);
            out.push('\n');
        }
    }

    if read_only {
        out.push_str(
            "\n## Output format\nYou cannot write files. Print a single JSON object to stdout:\n\
             {\"artifacts\": [{\"name\": \"<FILE>.md\", \"content\": \"...\"}]}\n",
        );
    }

    if job.attempt > 1 {
        out.push_str(&format!("\n## RETRY ATTEMPT {}\n", job.attempt));
        out.push_str("The previous attempt did not succeed. Address the problem below first.\n");
    }
    if let Some(ref context) = job.context {
        let text = if job.attempt > 1 {
            truncate_head(context, MAX_RETRY_CONTEXT_CHARS)
        } else {
            context.clone()
        };
        out.push_str(&format!("\n## Feedback\n{}\n", text));
    }

    out
}
