use serde::Deserialize;
use std::error::Error;
use std::fmt;
use std::fs;
use std::sync::Arc;
use log::info;

const DEFAULT_ASSISTANT_NAME: &str = "Cla!";

const DEFAULT_SYSTEM_PROMPT: &str = "Sei un assistente AI utile e cordiale specializzato nell'istruzione. \
Rispondi sempre e solo in italiano. \
Alle domande su chi sei rispondi sempre: Sono vision oppure sono vision un AI creata da Cla!. \
Alle domande relative su chi ti ha creato rispondi sempre: Sono stato creato dal team di Cla!";

const DEFAULT_GREETING: &str = "Ciao! Sono Cla, la tua assistente AI. Come posso aiutarti oggi?";

#[derive(Debug)]
pub enum PromptError {
    MissingField(&'static str),
    IoError(std::io::Error),
    JsonError(serde_json::Error),
}

impl fmt::Display for PromptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptError::MissingField(key) => write!(f, "Persona field '{}' is empty", key),
            PromptError::IoError(e) => write!(f, "Persona file IO error: {}", e),
            PromptError::JsonError(e) => write!(f, "Persona JSON parsing error: {}", e),
        }
    }
}

impl Error for PromptError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PromptError::IoError(e) => Some(e),
            PromptError::JsonError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PromptError {
    fn from(err: std::io::Error) -> Self {
        PromptError::IoError(err)
    }
}

impl From<serde_json::Error> for PromptError {
    fn from(err: serde_json::Error) -> Self {
        PromptError::JsonError(err)
    }
}

/// Who the assistant is: the system preamble plus what the test page shows.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Persona {
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,
    pub system_prompt: String,
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

fn default_assistant_name() -> String {
    DEFAULT_ASSISTANT_NAME.to_string()
}

fn default_greeting() -> String {
    DEFAULT_GREETING.to_string()
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            greeting: default_greeting(),
        }
    }
}

impl Persona {
    fn validate(&self) -> Result<(), PromptError> {
        if self.system_prompt.trim().is_empty() {
            return Err(PromptError::MissingField("system_prompt"));
        }
        if self.assistant_name.trim().is_empty() {
            return Err(PromptError::MissingField("assistant_name"));
        }
        Ok(())
    }
}

pub fn parse_persona(json: &str) -> Result<Persona, PromptError> {
    let persona: Persona = serde_json::from_str(json)?;
    persona.validate()?;
    Ok(persona)
}

/// Loads the persona file, or the built-in persona when no path is configured.
pub fn load_persona(path: Option<&str>) -> Result<Arc<Persona>, PromptError> {
    match path.filter(|p| !p.trim().is_empty()) {
        Some(path) => {
            let file_content = fs::read_to_string(path)?;
            let persona = parse_persona(&file_content)?;
            info!("Loaded persona '{}' from '{}'", persona.assistant_name, path);
            Ok(Arc::new(persona))
        }
        None => {
            info!("Using built-in persona");
            Ok(Arc::new(Persona::default()))
        }
    }
}
