//! Backend-specific prompt formatting.
//!
//! Formatting is pure and never fails: the template is chosen from the
//! backend's [`TemplateKind`], and the user's question is substituted into it.

use crate::catalog::{BackendDescriptor, TemplateKind};

/// Output language for guideline text and fallback messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    English,
    Spanish,
}

impl Language {
    /// Parse an optional language tag (`"es"`, `"es-MX"`, `"en"`, ...).
    ///
    /// Unknown or missing tags resolve to English.
    pub fn from_tag(tag: Option<&str>) -> Self {
        let Some(tag) = tag else {
            return Language::English;
        };
        let primary = tag
            .trim()
            .split(['-', '_'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        match primary.as_str() {
            "es" | "spa" | "spanish" | "espanol" | "español" => Language::Spanish,
            _ => Language::English,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Spanish => "es",
        }
    }

    /// Guideline preamble for chat-style templates.
    pub fn guidelines(&self) -> &'static [&'static str] {
        match self {
            Language::English => ENGLISH_GUIDELINES,
            Language::Spanish => SPANISH_GUIDELINES,
        }
    }
}

const ENGLISH_GUIDELINES: &[&str] = &[
    "You are a helpful assistant.",
    "Answer the question clearly and concisely.",
    "If you are not sure about something, say so honestly.",
];

const SPANISH_GUIDELINES: &[&str] = &[
    "Eres un asistente útil.",
    "Responde a la pregunta de forma clara y concisa.",
    "Si no estás seguro de algo, dilo con sinceridad.",
];

/// Instruction line used by the question/answer template.
pub(crate) const QA_INSTRUCTION: &str = "Answer the following question.";

/// Every instruction sentence this module can emit, in all languages.
pub(crate) fn instruction_phrases() -> impl Iterator<Item = &'static str> {
    ENGLISH_GUIDELINES
        .iter()
        .chain(SPANISH_GUIDELINES.iter())
        .copied()
        .chain(std::iter::once(QA_INSTRUCTION))
}

/// Extract the user's question from raw input.
///
/// Trims, collapses whitespace runs, and drops a leading `Q:`/`Question:` label
/// the user may have typed themselves.
pub fn extract_question(raw_input: &str) -> String {
    let collapsed = raw_input.split_whitespace().collect::<Vec<_>>().join(" ");
    for label in ["question:", "q:"] {
        if collapsed.len() >= label.len()
            && collapsed.is_char_boundary(label.len())
            && collapsed[..label.len()].eq_ignore_ascii_case(label)
        {
            let rest = collapsed[label.len()..].trim_start();
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }
    collapsed
}

/// Format `raw_input` for `backend` in `language`.
pub fn format(raw_input: &str, backend: &BackendDescriptor, language: Language) -> String {
    let question = extract_question(raw_input);
    format_question(&question, backend.template, language)
}

fn format_question(question: &str, template: TemplateKind, language: Language) -> String {
    match template {
        TemplateKind::MistralInstruct => {
            let guidelines = language.guidelines().join(" ");
            format!("<s>[INST] {}\n\n{} [/INST]", guidelines, question)
        }
        TemplateKind::ZephyrChat => {
            let guidelines = language.guidelines().join(" ");
            format!(
                "<|system|>\n{}</s>\n<|user|>\n{}</s>\n<|assistant|>\n",
                guidelines, question
            )
        }
        TemplateKind::QuestionAnswer => {
            format!("{}\n\nQuestion: {}\nAnswer:", QA_INSTRUCTION, question)
        }
        TemplateKind::Generic => format!("Q: {}\nA:", question),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ExtractionKind, GenerationParameters};

    fn backend(template: TemplateKind) -> BackendDescriptor {
        BackendDescriptor::new(
            "test",
            template,
            ExtractionKind::Plain,
            GenerationParameters::default(),
        )
    }

    #[test]
    fn test_language_from_tag() {
        assert_eq!(Language::from_tag(None), Language::English);
        assert_eq!(Language::from_tag(Some("es")), Language::Spanish);
        assert_eq!(Language::from_tag(Some("ES-mx")), Language::Spanish);
        assert_eq!(Language::from_tag(Some("fr")), Language::English);
        assert_eq!(Language::from_tag(Some("")), Language::English);
    }

    #[test]
    fn test_extract_question() {
        assert_eq!(extract_question("  what   is\nrust? "), "what is rust?");
        assert_eq!(extract_question("Q: why is the sky blue"), "why is the sky blue");
        assert_eq!(extract_question("question:   define entropy"), "define entropy");
        // A bare label is kept rather than emptied.
        assert_eq!(extract_question("Q:"), "Q:");
        assert_eq!(extract_question("Quick question"), "Quick question");
    }

    #[test]
    fn test_generic_template() {
        let prompt = format("hello there", &backend(TemplateKind::Generic), Language::English);
        assert_eq!(prompt, "Q: hello there\nA:");
    }

    #[test]
    fn test_question_answer_template() {
        let prompt = format(
            "What is rust?",
            &backend(TemplateKind::QuestionAnswer),
            Language::English,
        );
        assert_eq!(
            prompt,
            "Answer the following question.\n\nQuestion: What is rust?\nAnswer:"
        );
    }

    #[test]
    fn test_mistral_template_has_guidelines() {
        let prompt = format(
            "What is rust?",
            &backend(TemplateKind::MistralInstruct),
            Language::English,
        );
        assert!(prompt.starts_with("<s>[INST] You are a helpful assistant."));
        assert!(prompt.ends_with("What is rust? [/INST]"));
    }

    #[test]
    fn test_zephyr_template_localized() {
        let prompt = format(
            "¿Qué es Rust?",
            &backend(TemplateKind::ZephyrChat),
            Language::Spanish,
        );
        assert!(prompt.starts_with("<|system|>\nEres un asistente útil."));
        assert!(prompt.contains("<|user|>\n¿Qué es Rust?</s>"));
        assert!(prompt.ends_with("<|assistant|>\n"));
    }

    #[test]
    fn test_non_chat_templates_ignore_language() {
        let en = format("x y", &backend(TemplateKind::Generic), Language::English);
        let es = format("x y", &backend(TemplateKind::Generic), Language::Spanish);
        assert_eq!(en, es);
    }
}
