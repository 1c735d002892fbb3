//! Per-language letter decks and bag filling.
//!
//! Each supported language has a static table of `(letter, count)` pairs.
//! The counts always sum to [`FULL_DECK`] tiles, which is what a long game
//! uses; a short game draws [`SHORT_DECK`] tiles from the same
//! distribution. The RNG is injected so tests can fill a bag
//! deterministically.

use crate::tile::Tile;
use rand::seq::SliceRandom;
use rand::RngCore;
use strum::EnumIter;

/// Total tiles in a full deck, and the tile count of a long game.
pub const FULL_DECK: u8 = 122;

/// Tile count of a short game.
pub const SHORT_DECK: u8 = 50;

/// The languages a conversation can be played in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum Language {
    English,
    French,
    Esperanto,
    /// English deck extended with Å, Ä and Ö.
    EnglishSwedish,
}

impl Language {
    /// The code used on the wire and in invite links.
    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::French => "fr",
            Language::Esperanto => "eo",
            Language::EnglishSwedish => "en-sv",
        }
    }

    pub fn from_code(code: &str) -> Option<Language> {
        match code {
            "en" => Some(Language::English),
            "fr" => Some(Language::French),
            "eo" => Some(Language::Esperanto),
            "en-sv" => Some(Language::EnglishSwedish),
            _ => None,
        }
    }

    fn deck(self) -> &'static [(&'static str, u8)] {
        match self {
            Language::English => ENGLISH,
            Language::French => FRENCH,
            Language::Esperanto => ESPERANTO,
            Language::EnglishSwedish => ENGLISH_SWEDISH,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

const ENGLISH: &[(&str, u8)] = &[
    ("E", 16),
    ("A", 12),
    ("I", 11),
    ("O", 10),
    ("N", 8),
    ("R", 8),
    ("T", 8),
    ("L", 5),
    ("S", 5),
    ("U", 5),
    ("D", 5),
    ("G", 4),
    ("H", 3),
    ("M", 3),
    ("B", 2),
    ("C", 2),
    ("F", 2),
    ("P", 2),
    ("V", 2),
    ("W", 2),
    ("Y", 2),
    ("J", 1),
    ("K", 1),
    ("Q", 1),
    ("X", 1),
    ("Z", 1),
];

const FRENCH: &[(&str, u8)] = &[
    ("E", 19),
    ("A", 11),
    ("I", 10),
    ("N", 7),
    ("O", 7),
    ("R", 7),
    ("S", 7),
    ("T", 7),
    ("U", 7),
    ("L", 6),
    ("D", 4),
    ("M", 4),
    ("B", 3),
    ("C", 3),
    ("F", 3),
    ("G", 3),
    ("P", 3),
    ("H", 2),
    ("V", 2),
    ("J", 1),
    ("K", 1),
    ("Q", 1),
    ("W", 1),
    ("X", 1),
    ("Y", 1),
    ("Z", 1),
];

const ESPERANTO: &[(&str, u8)] = &[
    ("A", 12),
    ("E", 11),
    ("O", 10),
    ("I", 9),
    ("N", 8),
    ("R", 6),
    ("S", 6),
    ("K", 5),
    ("L", 5),
    ("T", 5),
    ("U", 5),
    ("D", 4),
    ("J", 4),
    ("M", 4),
    ("P", 4),
    ("B", 2),
    ("C", 2),
    ("Ĉ", 2),
    ("F", 2),
    ("G", 2),
    ("Ĝ", 2),
    ("H", 2),
    ("Ŝ", 2),
    ("Ŭ", 2),
    ("V", 2),
    ("Z", 2),
    ("Ĥ", 1),
    ("Ĵ", 1),
];

const ENGLISH_SWEDISH: &[(&str, u8)] = &[
    ("E", 15),
    ("A", 11),
    ("I", 10),
    ("O", 9),
    ("T", 8),
    ("N", 7),
    ("R", 7),
    ("L", 5),
    ("S", 5),
    ("U", 5),
    ("D", 5),
    ("G", 4),
    ("H", 3),
    ("M", 3),
    ("B", 2),
    ("C", 2),
    ("F", 2),
    ("P", 2),
    ("V", 2),
    ("W", 2),
    ("Y", 2),
    ("Å", 2),
    ("Ä", 2),
    ("Ö", 2),
    ("J", 1),
    ("K", 1),
    ("Q", 1),
    ("X", 1),
    ("Z", 1),
];

/// Fills a bag of `n` tiles for `language`.
///
/// The deck's letter multiset is shuffled with the injected RNG and the
/// first `n` tiles become the bag, indexed in the order they will later be
/// drawn. `n` is clamped to `1..=FULL_DECK`.
pub fn fill_bag(language: Language, n: u8, rng: &mut dyn RngCore) -> Vec<Tile> {
    let n = n.clamp(1, FULL_DECK) as usize;

    let mut letters: Vec<&'static str> = Vec::with_capacity(FULL_DECK as usize);
    for &(letter, count) in language.deck() {
        for _ in 0..count {
            letters.push(letter);
        }
    }

    letters.shuffle(rng);
    letters.truncate(n);

    letters
        .into_iter()
        .enumerate()
        .map(|(index, letter)| Tile::in_bag(index as u8, letter))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;
    use std::collections::HashMap;
    use strum::IntoEnumIterator;

    #[test]
    fn every_deck_totals_a_full_deck() {
        for language in Language::iter() {
            let total: u32 = language.deck().iter().map(|&(_, n)| n as u32).sum();
            assert_eq!(total, FULL_DECK as u32, "{language}");
        }
    }

    #[test]
    fn letters_are_single_characters_of_at_most_four_bytes() {
        for language in Language::iter() {
            for &(letter, _) in language.deck() {
                assert_eq!(letter.chars().count(), 1, "{language} {letter:?}");
                assert!(letter.len() <= 4, "{language} {letter:?}");
            }
        }
    }

    #[test]
    fn codes_round_trip() {
        for language in Language::iter() {
            assert_eq!(Language::from_code(language.code()), Some(language));
        }
        assert_eq!(Language::from_code("tlh"), None);
    }

    #[test]
    fn full_bag_matches_the_deck_distribution() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let bag = fill_bag(Language::Esperanto, FULL_DECK, &mut rng);

        assert_eq!(bag.len(), FULL_DECK as usize);

        let mut counts: HashMap<&str, u8> = HashMap::new();
        for tile in &bag {
            assert!(tile.in_bag);
            *counts.entry(tile.letter).or_default() += 1;
        }

        for &(letter, count) in Language::Esperanto.deck() {
            assert_eq!(counts.get(letter), Some(&count), "{letter}");
        }
    }

    #[test]
    fn short_bag_is_a_sample_without_replacement() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let bag = fill_bag(Language::English, SHORT_DECK, &mut rng);

        assert_eq!(bag.len(), SHORT_DECK as usize);

        let mut counts: HashMap<&str, u8> = HashMap::new();
        for tile in &bag {
            *counts.entry(tile.letter).or_default() += 1;
        }

        // No letter can appear more often than the deck holds it.
        for (letter, count) in counts {
            let in_deck = Language::English
                .deck()
                .iter()
                .find(|&&(l, _)| l == letter)
                .map(|&(_, n)| n)
                .unwrap();
            assert!(count <= in_deck, "{letter} appears {count} times");
        }
    }

    #[test]
    fn indices_are_dense_and_fills_are_reproducible() {
        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let bag = fill_bag(Language::French, 30, &mut rng);

        for (i, tile) in bag.iter().enumerate() {
            assert_eq!(tile.index as usize, i);
        }

        let mut rng = Pcg64Mcg::seed_from_u64(42);
        let again = fill_bag(Language::French, 30, &mut rng);
        assert_eq!(bag, again);
    }

    #[test]
    fn tile_count_is_clamped() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        assert_eq!(fill_bag(Language::English, 0, &mut rng).len(), 1);
        assert_eq!(
            fill_bag(Language::English, u8::MAX, &mut rng).len(),
            FULL_DECK as usize
        );
    }
}
