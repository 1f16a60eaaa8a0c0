//! Built-in demo books and loading books from JSON files.

use crate::passage::{Book, ContentNode, NodeType};
use anyhow::{Context, Result};
use std::path::Path;

fn node(id: &str, order: u32, node_type: NodeType, arabic: &str, english: &str) -> ContentNode {
    ContentNode {
        id: id.to_string(),
        order,
        text_arabic: arabic.to_string(),
        text_english: english.to_string(),
        node_type,
    }
}

/// The demo catalog: Surah Al-Fatiha and the opening of Al-Shatibiyyah.
pub fn demo_books() -> Vec<Book> {
    use NodeType::{Line, Verse};
    vec![
        Book {
            id: "b1".to_string(),
            title_en: "Surah Al-Fatiha".to_string(),
            title_ar: "سُورَةُ الفَاتِحَة".to_string(),
            author: "The Holy Quran".to_string(),
            cover_image: None,
            nodes: vec![
                node("1", 1, Verse, "بِسْمِ ٱللَّهِ ٱلرَّحْمَـٰنِ ٱلرَّحِيمِ", "In the name of Allah, the Entirely Merciful, the Especially Merciful."),
                node("2", 2, Verse, "ٱلْحَمْدُ لِلَّهِ رَبِّ ٱلْعَـٰلَمِينَ", "[All] praise is [due] to Allah, Lord of the worlds -"),
                node("3", 3, Verse, "ٱلرَّحْمَـٰنِ ٱلرَّحِيمِ", "The Entirely Merciful, the Especially Merciful,"),
                node("4", 4, Verse, "مَـٰلِكِ يَوْمِ ٱلدِّينِ", "Sovereign of the Day of Recompense."),
                node("5", 5, Verse, "إِيَّاكَ نَعْبُدُ وَإِيَّاكَ نَسْتَعِينُ", "It is You we worship and You we ask for help."),
                node("6", 6, Verse, "ٱهْدِنَا ٱلصِّرَٰطَ ٱلْمُسْتَقِيمَ", "Guide us to the straight path -"),
                node("7", 7, Verse, "صِرَٰطَ ٱلَّذِينَ أَنْعَمْتَ عَلَيْهِمْ غَيْرِ ٱلْمَغْضُوبِ عَلَيْهِمْ وَلَا ٱلضَّآلِّينَ", "The path of those upon whom You have bestowed favor, not of those who have evoked [Your] anger or of those who are astray."),
            ],
        },
        Book {
            id: "b2".to_string(),
            title_en: "Al-Shatibiyyah (Intro)".to_string(),
            title_ar: "متن الشاطبية".to_string(),
            author: "Imam Al-Shatibi".to_string(),
            cover_image: None,
            nodes: vec![
                node("s1", 1, Line, "بَدَأْتُ بِبِسْمِ اللهِ في النَّظْمِ أوَّلاً ... تَبَارَكَ رَحْمَاناً رَحِيماً وَمَوْئِلاً", "I began with Bismillah in the poem first..."),
                node("s2", 2, Line, "وَثَنَّيْتُ صَلَّى اللهُ رَبِّي عَلى الرِّضَا ... مُحَمَّدٍ الْمُهْدَى إِلى النَّاسِ مُرْسَلاً", "And secondly, may Allah send peace upon the Content One..."),
            ],
        },
    ]
}

pub fn find_book(id: &str) -> Option<Book> {
    demo_books().into_iter().find(|b| b.id == id)
}

/// Load a single book from a JSON file.
pub fn load_book(path: impl AsRef<Path>) -> Result<Book> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read book file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid book file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passage::Passage;

    #[test]
    fn fatiha_has_seven_ordered_verses() {
        let book = find_book("b1").unwrap();
        assert_eq!(book.nodes.len(), 7);
        let passage = Passage::from_book(&book);
        assert!(passage.text().starts_with("بِسْمِ ٱللَّهِ"));
        assert!(passage.text().ends_with("وَلَا ٱلضَّآلِّينَ"));
    }

    #[test]
    fn unknown_id_is_none() {
        assert!(find_book("nope").is_none());
    }

    #[test]
    fn load_book_round_trips_through_a_file() {
        let book = find_book("b2").unwrap();
        let path = std::env::temp_dir().join(format!("muhaffiz-book-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string(&book).unwrap()).unwrap();

        let loaded = load_book(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, book);
    }

    #[test]
    fn load_book_reports_missing_file() {
        let err = load_book("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("failed to read book file"));
    }
}
