/// Models the chat client offers. Identifiers are the engine's model tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    Llama32_1B,
    Llama32_3B,
    Qwen25_05B,
    Qwen25_15B,
    Gemma3_1B,
    Phi35Mini,
    SmolLm2_360M,
}

impl Model {
    pub const DEFAULT: Model = Model::Llama32_1B;

    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Llama32_1B => "llama3.2:1b",
            Model::Llama32_3B => "llama3.2:3b",
            Model::Qwen25_05B => "qwen2.5:0.5b",
            Model::Qwen25_15B => "qwen2.5:1.5b",
            Model::Gemma3_1B => "gemma3:1b",
            Model::Phi35Mini => "phi3.5:3.8b",
            Model::SmolLm2_360M => "smollm2:360m",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::all().into_iter().find(|m| m.as_str().eq_ignore_ascii_case(s))
    }

    pub fn all() -> Vec<Model> {
        vec![
            Model::Llama32_1B,
            Model::Llama32_3B,
            Model::Qwen25_05B,
            Model::Qwen25_15B,
            Model::Gemma3_1B,
            Model::Phi35Mini,
            Model::SmolLm2_360M,
        ]
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Model::Llama32_1B => "Llama 3.2 1B",
            Model::Llama32_3B => "Llama 3.2 3B",
            Model::Qwen25_05B => "Qwen 2.5 0.5B",
            Model::Qwen25_15B => "Qwen 2.5 1.5B",
            Model::Gemma3_1B => "Gemma 3 1B",
            Model::Phi35Mini => "Phi 3.5 Mini",
            Model::SmolLm2_360M => "SmolLM2 360M",
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_is_membership() {
        for model in Model::all() {
            assert_eq!(Model::from_str(model.as_str()), Some(model));
        }
        assert_eq!(Model::from_str(" Gemma3:1B "), Some(Model::Gemma3_1B));
        assert_eq!(Model::from_str("llama3.2"), None);
        assert_eq!(Model::from_str(""), None);
    }
}
