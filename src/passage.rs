//! Books, text nodes and the passage a session recites.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Verse,
    Line,
}

/// One verse or line of a memorization text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentNode {
    pub id: String,
    pub order: u32,
    pub text_arabic: String,
    pub text_english: String,
    pub node_type: NodeType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title_en: String,
    pub title_ar: String,
    pub author: String,
    #[serde(default)]
    pub cover_image: Option<String>,
    pub nodes: Vec<ContentNode>,
}

/// The fixed text block a session is built around. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    title: String,
    text: String,
}

impl Passage {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
        }
    }

    /// Join the book's source-language text in node order.
    pub fn from_book(book: &Book) -> Self {
        let mut nodes: Vec<&ContentNode> = book.nodes.iter().collect();
        nodes.sort_by_key(|n| n.order);
        let text = nodes
            .iter()
            .map(|n| n.text_arabic.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self::new(book.title_en.clone(), text)
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Tutor persona prompt with the passage embedded verbatim.
    pub fn system_instruction(&self) -> String {
        format!(
            r#"You are a kind, patient, and precise Hifdh (memorization) teacher (Muhaffiz).
The student is memorizing the following text from "{title}":

"""
{text}
"""

Your tasks:
1. Listen carefully to the user's recitation.
2. If they recite correctly, gently encourage them with short praises like "Sahih" (Correct) or "Mumtaz" (Excellent) and let them continue. Do not interrupt too often if they are flowing well.
3. If they make a mistake, gently interrupt and correct only the word or phrase they missed based EXACTLY on the text provided above.
4. If they pause for more than 3 seconds, prompt them with the next word from the text provided.
5. Speak clearly. Your responses should be primarily in English but use Arabic terms for the corrections.
6. CRITICAL: STRICTLY follow the provided text above. Do not use your own internal knowledge to provide verses or lines that are not in the text block above. If the user makes a mistake relative to the text above, correct them. If the user asks for the next line, provide it ONLY if it is in the text above. Use ONLY the provided text as the source of truth."#,
            title = self.title,
            text = self.text,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, order: u32, text: &str) -> ContentNode {
        ContentNode {
            id: id.to_string(),
            order,
            text_arabic: text.to_string(),
            text_english: String::new(),
            node_type: NodeType::Verse,
        }
    }

    fn book(nodes: Vec<ContentNode>) -> Book {
        Book {
            id: "t".to_string(),
            title_en: "Test".to_string(),
            title_ar: "اختبار".to_string(),
            author: "nobody".to_string(),
            cover_image: None,
            nodes,
        }
    }

    #[test]
    fn joins_nodes_in_order() {
        let passage = Passage::from_book(&book(vec![
            node("2", 2, "ب"),
            node("1", 1, "أ"),
            node("3", 3, "ت"),
        ]));
        assert_eq!(passage.text(), "أ ب ت");
        assert_eq!(passage.title(), "Test");
    }

    #[test]
    fn empty_book_gives_empty_passage() {
        assert!(Passage::from_book(&book(vec![])).is_empty());
        assert!(Passage::from_book(&book(vec![node("1", 1, "   ")])).is_empty());
        assert!(Passage::new("x", " \n").is_empty());
    }

    #[test]
    fn instruction_embeds_text_verbatim() {
        let passage = Passage::new("Surah Al-Fatiha", "بِسْمِ ٱللَّهِ ٱلرَّحْمَـٰنِ ٱلرَّحِيمِ");
        let instruction = passage.system_instruction();
        assert!(instruction.contains("\"\"\"\nبِسْمِ ٱللَّهِ ٱلرَّحْمَـٰنِ ٱلرَّحِيمِ\n\"\"\""));
        assert!(instruction.contains("from \"Surah Al-Fatiha\""));
        assert!(instruction.contains("STRICTLY follow the provided text"));
    }

    #[test]
    fn book_deserializes_from_json() {
        let json = r#"{
            "id": "b9", "title_en": "T", "title_ar": "ت", "author": "A",
            "nodes": [{"id": "1", "order": 1, "text_arabic": "x", "text_english": "y", "node_type": "line"}]
        }"#;
        let book: Book = serde_json::from_str(json).unwrap();
        assert_eq!(book.nodes[0].node_type, NodeType::Line);
        assert!(book.cover_image.is_none());
    }
}
