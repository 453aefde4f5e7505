use crate::schema::TargetSchema;
use crate::{ClassifyRequest, FileKind};

/// Cuts `content` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(content: &str, max_chars: usize) -> &str {
    match content.char_indices().nth(max_chars) {
        Some((idx, _)) => &content[..idx],
        None => content,
    }
}

pub fn classification_prompt(
    request: &ClassifyRequest<'_>,
    schema: &TargetSchema,
    max_chars: usize,
) -> String {
    let body = truncate_chars(request.content, max_chars);
    let fence = fence_for(request.path);
    let (subject, focus) = match request.kind {
        FileKind::Code => (
            "a source code file",
            "Focus on business semantics and domain logic, not technical implementation details.",
        ),
        FileKind::Configuration => (
            "a configuration file",
            "Focus on the business functionality and integrations this configuration enables.",
        ),
    };
    format!(
        "You are a senior software architect analyzing {subject} from a service codebase.\n\n\
         File: {path}\nProject: {project}\n\n\
         ```{fence}\n{body}\n```\n\n\
         Extract business semantic information. Return ONLY a valid JSON object with this exact structure:\n\n\
         {schema}\n\n\
         {focus} Return only the JSON object, no additional text.",
        path = request.path,
        project = request.project,
        schema = schema.describe(),
    )
}

fn fence_for(path: &str) -> &str {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
}
