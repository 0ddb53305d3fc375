//! Slash commands understood by the dispatcher

/// Recognized slash command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    /// `/list`
    List,
    /// `/current`
    Current,
    /// `/cookie <value>`
    Cookie(String),
    /// `/use <model> [param]` or `/<model> [param]`
    Use {
        /// Model name as typed
        model: String,
        /// Rest of the line
        param: Option<String>,
    },
    /// Command keyword with missing arguments
    Invalid,
}

/// Split `/name rest` into the command word and its trimmed arguments
fn split_command(input: &str) -> Option<(&str, &str)> {
    let input = input.trim().strip_prefix('/')?;
    match input.split_once(char::is_whitespace) {
        Some((name, rest)) => Some((name, rest.trim())),
        None => Some((input, "")),
    }
}

fn non_empty(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

impl SlashCommand {
    /// Parse a prompt; `None` when it is not a command and should be sent on
    ///
    /// The `/<model>` shorthand only applies to names accepted by `is_model`,
    /// so prompts such as `/etc/hosts explained` still reach the backend.
    pub fn parse(input: &str, is_model: impl Fn(&str) -> bool) -> Option<Self> {
        let (name, args) = split_command(input)?;
        let command = match name {
            "list" => SlashCommand::List,
            "current" => SlashCommand::Current,
            "cookie" => match non_empty(args) {
                Some(value) => SlashCommand::Cookie(value),
                None => SlashCommand::Invalid,
            },
            "use" => match split_command(&format!("/{args}")) {
                Some((model, param)) if !model.is_empty() => SlashCommand::Use {
                    model: model.to_string(),
                    param: non_empty(param),
                },
                _ => SlashCommand::Invalid,
            },
            model if is_model(model) => SlashCommand::Use {
                model: model.to_string(),
                param: non_empty(args),
            },
            _ => return None,
        };
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Option<SlashCommand> {
        SlashCommand::parse(input, |name| matches!(name, "bing" | "gradio" | "claude+"))
    }

    #[test]
    fn test_keywords() {
        assert_eq!(parse("/list"), Some(SlashCommand::List));
        assert_eq!(parse("  /current  "), Some(SlashCommand::Current));
        assert_eq!(parse("/cookie abc=="), Some(SlashCommand::Cookie("abc==".into())));
        assert_eq!(parse("/cookie   "), Some(SlashCommand::Invalid));
        assert_eq!(parse("/use"), Some(SlashCommand::Invalid));
    }

    #[test]
    fn test_use_and_shorthand() {
        assert_eq!(
            parse("/use gradio https://example.com/space"),
            Some(SlashCommand::Use {
                model: "gradio".into(),
                param: Some("https://example.com/space".into())
            })
        );
        assert_eq!(
            parse("/use bogus-model"),
            Some(SlashCommand::Use {
                model: "bogus-model".into(),
                param: None
            })
        );
        assert_eq!(
            parse("/claude+"),
            Some(SlashCommand::Use {
                model: "claude+".into(),
                param: None
            })
        );
    }

    #[test]
    fn test_non_commands_pass_through() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("/etc/hosts explained"), None);
        assert_eq!(parse("/listing"), None);
    }
}
