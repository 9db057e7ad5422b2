use std::sync::LazyLock;

use regex::Regex;

static PARENTHESISED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\([^)]*\)").unwrap());

/// Greek capitals that look like Latin ones, plus accented vowels, folded to
/// the Latin glyph the registry uses in pack descriptions.
const FOLD: &[(char, char)] = &[
    ('Χ', 'X'),
    ('Α', 'A'),
    ('Ε', 'E'),
    ('Ι', 'I'),
    ('Υ', 'Y'),
    ('Ο', 'O'),
    ('Η', 'H'),
    ('Ό', 'O'),
    ('Ί', 'I'),
    ('Ά', 'A'),
    ('Έ', 'E'),
    ('Ή', 'H'),
    ('Ύ', 'Y'),
    ('Τ', 'T'),
    ('Β', 'B'),
    ('Μ', 'M'),
    ('Ρ', 'P'),
    ('Ν', 'N'),
    ('Κ', 'K'),
];

/// Normalise a drug description for matching.
///
/// Strips parenthesised content, upper-cases, folds look-alike Greek
/// letters to Latin and trims. Idempotent.
pub fn clean_description(description: &str) -> String {
    let stripped = PARENTHESISED.replace_all(description, "");
    stripped
        .to_uppercase()
        .chars()
        .map(fold_char)
        .collect::<String>()
        .trim()
        .to_string()
}

fn fold_char(c: char) -> char {
    FOLD.iter()
        .find(|(from, _)| *from == c)
        .map(|(_, to)| *to)
        .unwrap_or(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_greek_lookalikes() {
        assert_eq!(clean_description("ΒΤΧ 28"), "BTX 28");
        assert_eq!(clean_description("ΓΕΝΌΣΗΜΟ"), "ΓENOΣHMO");
    }

    #[test]
    fn strips_parentheses_and_trims() {
        assert_eq!(
            clean_description("  pulmoton (30 doses) btx1 "),
            "PULMOTON  BTX1"
        );
    }

    #[test]
    fn lowercase_greek_is_uppercased_first() {
        assert_eq!(clean_description("δισκία"), "ΔIΣKIA");
    }

    #[test]
    fn idempotent() {
        let once = clean_description("SERTRAL CAPS 100MG/CAP BTX2 BLIST X7 ΓΕΝΌΣΗΜΟ");
        assert_eq!(clean_description(&once), once);
    }
}
