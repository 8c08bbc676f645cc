//! Message template rendering.
//! Supports `{{first_name}}`, `{{company}}`, or any other lead field by name.
//! Unknown fields render empty; an unterminated `{{` is kept verbatim.

use std::collections::HashMap;

/// Render `template` against lead fields.
pub fn render(template: &str, fields: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = fields.get(key) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Render an optional subject line.
pub fn render_opt(template: Option<&str>, fields: &HashMap<String, String>) -> Option<String> {
    template.map(|t| render(t, fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> HashMap<String, String> {
        HashMap::from([
            ("first_name".to_string(), "Linh".to_string()),
            ("company".to_string(), "Acme".to_string()),
        ])
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(
            render("Hi {{first_name}}, how is {{ company }}?", &fields()),
            "Hi Linh, how is Acme?"
        );
    }

    #[test]
    fn test_unknown_field_renders_empty() {
        assert_eq!(render("Hi {{nickname}}!", &fields()), "Hi !");
    }

    #[test]
    fn test_unterminated_kept() {
        assert_eq!(render("Hi {{first_name", &fields()), "Hi {{first_name");
        assert_eq!(render("no placeholders", &fields()), "no placeholders");
    }

    #[test]
    fn test_subject() {
        assert_eq!(
            render_opt(Some("Re: {{company}}"), &fields()),
            Some("Re: Acme".to_string())
        );
        assert_eq!(render_opt(None, &fields()), None);
    }
}
