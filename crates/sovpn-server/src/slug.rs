use std::path::Path;

/// Derive the canonical filesystem-safe slug for a display name.
///
/// Pure function: trim, lowercase, fold common Latin diacritics to ASCII,
/// collapse every run of non-alphanumeric characters into a single hyphen and
/// strip leading/trailing hyphens. May return an empty string for names with
/// no usable characters; callers must treat that as invalid.
pub fn derive(display_name: &str) -> String {
    let mut out = String::with_capacity(display_name.len());
    let mut pending_separator = false;

    for c in display_name.trim().chars() {
        let folded = fold_char(c);
        if folded.is_empty() {
            // Non-alphanumeric: remember that a separator is due, but only
            // emit it once the next alphanumeric character arrives.
            if !out.is_empty() {
                pending_separator = true;
            }
            continue;
        }
        if pending_separator {
            out.push('-');
            pending_separator = false;
        }
        out.push_str(&folded);
    }

    out
}

/// Check whether a client with this slug already exists under `clients_dir`.
///
/// The directory is the uniqueness oracle: a slug is taken exactly when its
/// client directory is present.
pub fn exists(clients_dir: &Path, slug: &str) -> bool {
    clients_dir.join(slug).is_dir()
}

/// Lowercase and transliterate a single character, or return "" for
/// characters that act as separators.
fn fold_char(c: char) -> String {
    if c.is_ascii_alphanumeric() {
        return c.to_ascii_lowercase().to_string();
    }
    // Common Latin diacritics; anything else non-ASCII collapses to a separator.
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ß' => "ss",
        'æ' | 'Æ' => "ae",
        'ø' | 'Ø' => "o",
        _ => "",
    };
    folded.to_string()
}
