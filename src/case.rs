//! Name derivations for resources and fields: snake_case, camelCase, PascalCase, plurals, slugs.
//! Labels are human strings such as "Administrator Role" or "Av. CPC"; every storage key is derived from them.

/// Split a label into lowercase words. Any non-alphanumeric character separates words, and so
/// does a lower-to-upper transition ("publishedAt" -> ["published", "at"]).
pub fn words(label: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in label.chars() {
        if !c.is_alphanumeric() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// e.g. "Administrator Role" -> "administrator_role"
pub fn snake_case(label: &str) -> String {
    words(label).join("_")
}

/// e.g. "Administrator Role" -> "administratorRole"
pub fn camel_case(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for (i, w) in words(label).iter().enumerate() {
        if i == 0 {
            out.push_str(w);
        } else {
            out.push_str(&capitalize(w));
        }
    }
    out
}

/// e.g. "Administrator Role" -> "AdministratorRole"
pub fn pascal_case(label: &str) -> String {
    words(label).iter().map(|w| capitalize(w)).collect()
}

/// e.g. "Administrator Role" -> "administrator-role"
pub fn slug(label: &str) -> String {
    slug::slugify(words(label).join(" "))
}

/// English plural of a single lowercase word.
pub fn pluralize_word(word: &str) -> String {
    const IRREGULAR: &[(&str, &str)] = &[
        ("person", "people"),
        ("child", "children"),
        ("man", "men"),
        ("woman", "women"),
    ];
    if let Some((_, plural)) = IRREGULAR.iter().find(|(s, _)| *s == word) {
        return (*plural).to_string();
    }
    let is_vowel = |c: char| matches!(c, 'a' | 'e' | 'i' | 'o' | 'u');
    if let Some(stem) = word.strip_suffix('y') {
        if stem.chars().last().map(|c| !is_vowel(c)).unwrap_or(false) {
            return format!("{}ies", stem);
        }
    }
    if word.ends_with('s')
        || word.ends_with('x')
        || word.ends_with('z')
        || word.ends_with("ch")
        || word.ends_with("sh")
    {
        return format!("{}es", word);
    }
    format!("{}s", word)
}

/// Pluralize the last word of a label: "Administrator Role" -> "Administrator Roles".
pub fn pluralize(label: &str) -> String {
    let mut ws = words(label);
    if let Some(last) = ws.pop() {
        ws.push(pluralize_word(&last));
    }
    ws.join(" ")
}

/// e.g. "create:blog-post" -> "Create blog post"
pub fn sentence_case(s: &str) -> String {
    capitalize(&words(s).join(" "))
}
