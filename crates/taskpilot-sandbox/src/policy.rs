//! Request admission checks

use crate::{CodeRequest, ExecutionMode, Language, SandboxConfig, SandboxError};

/// Resolve the request's language and reject anything the config forbids
pub fn admit(config: &SandboxConfig, request: &CodeRequest) -> Result<Language, SandboxError> {
    let language: Language = request.language.parse()?;

    if !config.allowed_languages.contains(&language) {
        return Err(SandboxError::PolicyViolation(format!(
            "language '{}' is not allowed",
            language
        )));
    }

    if request.source.trim().is_empty() {
        return Err(SandboxError::PolicyViolation("empty source".to_string()));
    }

    if request.source.len() > config.limits.max_source_bytes {
        return Err(SandboxError::PolicyViolation(format!(
            "source is {} bytes, limit is {}",
            request.source.len(),
            config.limits.max_source_bytes
        )));
    }

    if request.mode == ExecutionMode::Expression
        && matches!(language, Language::Shell | Language::Bash)
    {
        return Err(SandboxError::PolicyViolation(format!(
            "expression mode is not supported for {}",
            language
        )));
    }

    Ok(language)
}

/// Program and arguments that execute `source` for `language`
pub fn command_line(language: Language, mode: ExecutionMode, source: &str) -> (&'static str, Vec<String>) {
    match (language, mode) {
        (Language::Python, ExecutionMode::Script) => {
            ("python3", vec!["-c".to_string(), source.to_string()])
        }
        (Language::Python, ExecutionMode::Expression) => (
            "python3",
            vec![
                "-c".to_string(),
                "import sys; print(eval(sys.argv[1]))".to_string(),
                source.to_string(),
            ],
        ),
        (Language::Node, ExecutionMode::Script) => ("node", vec!["-e".to_string(), source.to_string()]),
        (Language::Node, ExecutionMode::Expression) => {
            ("node", vec!["-p".to_string(), source.to_string()])
        }
        (Language::Shell, _) => ("sh", vec!["-c".to_string(), source.to_string()]),
        (Language::Bash, _) => ("bash", vec!["-c".to_string(), source.to_string()]),
    }
}
