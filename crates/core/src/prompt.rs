use crate::domain::conversation::{AgentProfile, Skill};

pub const BASE_SYSTEM_PROMPT: &str = "You are a helpful personal AI assistant. You can assist with questions, tasks, and general conversation. Be concise but friendly. When you don't know something, say so. Use tools when appropriate.";

/// System prompt for a turn: the agent's own prompt (or the base prompt),
/// followed by an "Active Skills" section listing enabled skills.
pub fn build_system_prompt(skills: &[Skill], agent: Option<&AgentProfile>) -> String {
    let base_prompt = agent
        .map(|agent| agent.system_prompt.trim())
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or(BASE_SYSTEM_PROMPT);

    let sections: Vec<String> = skills
        .iter()
        .filter(|skill| skill.enabled)
        .map(|skill| {
            let mut lines = vec![format!("### {}", skill.name), skill.description.clone()];
            if let Some(prompt) = skill.config.as_ref().and_then(|config| config.system_prompt.as_ref())
            {
                lines.push(prompt.clone());
            }
            lines.join("\n")
        })
        .collect();

    if sections.is_empty() {
        return base_prompt.to_string();
    }

    format!("{base_prompt}\n\n## Active Skills\n\n{}", sections.join("\n\n"))
}
