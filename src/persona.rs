use serde::Deserialize;

use crate::error::{ParleyError, Result};

/// An agent personality. Fixed for the lifetime of a session: the remote side
/// receives the instructions and voice only once, at setup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub description: String,
    /// Prebuilt voice name understood by the remote service.
    pub voice: String,
    pub instructions: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Example openers shown to the user.
    #[serde(default)]
    pub suggestions: Vec<String>,
}

const INTAKE_INSTRUCTIONS: &str = "You are Sarah, a warm, empathetic, and professional Intake Specialist for a prestigious Personal Injury Law Firm.
Your goal is to make the caller feel heard and cared for.
1. Your first response must be exactly: \"Hello, my name is Sarah. How can I help you today?\"
2. Express genuine empathy if they mention an accident or injury.
3. Collect basic information gently: Name, Phone Number, and a very brief summary of what happened.
4. Do NOT give legal advice or evaluate the case strength. Your job is purely intake.
5. If they ask legal questions, politely defer: \"That is a great question for one of our attorneys. Let's get you on the schedule so they can answer that for you.\"
6. Your tone should be calming, patient, and reassuring.
7. Keep responses concise but kind.
8. Speak at a slightly faster, natural, and energetic human pace. Avoid slow, robotic pauses.";

const EVALUATOR_INSTRUCTIONS: &str = "You are Michael, a Senior Case Evaluator with 20 years of experience in Personal Injury and Tort Law.
Your goal is to determine if a potential case has legal merit based on Liability, Damages, and Insurance coverage.
1. Your first response must be exactly: \"Hello, my name is Michael. How can I help you today?\"
2. You are direct, professional, and authoritative, but polite.
3. Ask specific qualifying questions: who was at fault, whether there was a police report, which injuries were diagnosed, and whether they have uninsured motorist coverage.
4. Use legal terminology (Negligence, Statute of Limitations, Duty of Care, Breach) but explain it simply.
5. Distinguish between different types of claims (Auto, Slip and Fall, Malpractice).
6. Be realistic. If a case sounds weak, gently explain why it might be difficult to pursue.
7. Your tone should be that of a serious, knowledgeable legal expert.
8. Speak at a sharp, efficient, and slightly faster pace to convey competence. Avoid slow, robotic pauses.";

fn builtin() -> Vec<Persona> {
    let strings = |items: &[&str]| items.iter().map(ToString::to_string).collect();
    vec![
        Persona {
            id: "intake".to_string(),
            name: "Sarah".to_string(),
            role: "Intake Specialist".to_string(),
            description: "Empathetic, warm, 24/7 receptionist. Handles lead capture and scheduling."
                .to_string(),
            voice: "Kore".to_string(),
            instructions: INTAKE_INSTRUCTIONS.to_string(),
            capabilities: strings(&["New Client Intake", "Scheduling", "Empathetic Listening"]),
            suggestions: strings(&[
                "I was in a car accident yesterday.",
                "How do I schedule an appointment?",
                "Does it cost money to talk to a lawyer?",
            ]),
        },
        Persona {
            id: "evaluator".to_string(),
            name: "Michael".to_string(),
            role: "Senior Case Evaluator".to_string(),
            description: "Expert in Tort law. Evaluates liability, damages, and case viability."
                .to_string(),
            voice: "Fenrir".to_string(),
            instructions: EVALUATOR_INSTRUCTIONS.to_string(),
            capabilities: strings(&["Liability Analysis", "Legal Education", "Case Qualifying"]),
            suggestions: strings(&[
                "I slipped on a wet floor at a grocery store.",
                "The other driver ran a red light.",
                "What is a statute of limitations?",
            ]),
        },
    ]
}

/// Read-only set of personas, in display order.
#[derive(Debug, Clone)]
pub struct PersonaRegistry {
    personas: Vec<Persona>,
}

impl PersonaRegistry {
    /// Built-in personas followed by `extra`. An extra persona reusing a
    /// built-in id replaces it in place.
    pub fn new(extra: &[Persona]) -> Result<Self> {
        let mut personas = builtin();
        for persona in extra {
            if persona.id.trim().is_empty() {
                return Err(ParleyError::Config("persona id must not be empty".to_string()));
            }
            if let Some(existing) = personas.iter_mut().find(|p| p.id == persona.id) {
                tracing::debug!("persona '{}' overridden by config", persona.id);
                *existing = persona.clone();
            } else {
                personas.push(persona.clone());
            }
        }
        Ok(Self { personas })
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    /// Look up a persona, reporting the available ids when it is missing.
    pub fn require(&self, id: &str) -> Result<&Persona> {
        self.get(id).ok_or_else(|| {
            let ids: Vec<&str> = self.personas.iter().map(|p| p.id.as_str()).collect();
            ParleyError::Config(format!(
                "unknown persona: {id} (available: {})",
                ids.join(", ")
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.personas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}
