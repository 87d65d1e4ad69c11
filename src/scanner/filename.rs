//! Filename convention parser.
//!
//! Catalog images are conventionally named
//! `dynasty_author_title_category_technique_inkstyle_dimensions_material_museum_tags.ext`,
//! for example
//! `宋代_张择端_清明上河图_人物_工笔_设色_28.7cmX333.5cm_绢本_北京故宫博物院_人物,古装,彩绘.jpg`.
//! Parsing never fails: missing trailing segments become `None`, unknown
//! vocabulary tokens become `None`, and a name without any delimiter is
//! treated as a bare title.

use serde::Serialize;
use std::path::Path;

use crate::db::{Category, InkColorStyle, Technique};

const DELIMITER: char = '_';

/// Candidate fields derived from a file name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilenameFields {
    pub dynasty: Option<String>,
    pub author: Option<String>,
    pub title: String,
    pub category: Option<Category>,
    pub technique: Option<Technique>,
    pub ink_color_style: Option<InkColorStyle>,
    pub dimensions: Option<String>,
    pub material: Option<String>,
    pub museum: Option<String>,
    pub tags: Vec<String>,
}

/// File name without directory or extension.
pub fn file_stem(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| filename.to_string())
}

pub fn parse_filename(filename: &str) -> FilenameFields {
    let stem = file_stem(filename);

    // A name without delimiters is read as a bare title; no dynasty is guessed from it.
    if !stem.contains(DELIMITER) {
        return FilenameFields {
            title: stem,
            ..Default::default()
        };
    }

    let parts: Vec<&str> = stem.split(DELIMITER).collect();
    let segment = |index: usize| -> Option<String> {
        parts
            .get(index)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    FilenameFields {
        dynasty: segment(0),
        author: segment(1),
        title: segment(2).unwrap_or_else(|| stem.clone()),
        category: segment(3).as_deref().and_then(Category::from_token),
        technique: segment(4).as_deref().and_then(Technique::from_token),
        ink_color_style: segment(5).as_deref().and_then(InkColorStyle::from_token),
        dimensions: segment(6),
        material: segment(7),
        museum: segment(8),
        tags: segment(9).map(|s| split_tags(&s)).unwrap_or_default(),
    }
}

/// Splits a tag segment on ASCII or full-width commas, keeping order.
fn split_tags(segment: &str) -> Vec<String> {
    segment
        .split([',', '，'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_convention() {
        let fields = parse_filename(
            "宋代_张择端_清明上河图_人物_工笔_设色_28.7cmX333.5cm_绢本_北京故宫博物院_人物,古装,彩绘.jpg",
        );

        assert_eq!(fields.dynasty.as_deref(), Some("宋代"));
        assert_eq!(fields.author.as_deref(), Some("张择端"));
        assert_eq!(fields.title, "清明上河图");
        assert_eq!(fields.category, Some(Category::Person));
        assert_eq!(fields.technique, Some(Technique::FineBrush));
        assert_eq!(fields.ink_color_style, Some(InkColorStyle::Colored));
        assert_eq!(fields.dimensions.as_deref(), Some("28.7cmX333.5cm"));
        assert_eq!(fields.material.as_deref(), Some("绢本"));
        assert_eq!(fields.museum.as_deref(), Some("北京故宫博物院"));
        assert_eq!(fields.tags, vec!["人物", "古装", "彩绘"]);
    }

    #[test]
    fn test_trailing_segments_missing() {
        let fields = parse_filename("元代_黄公望_富春山居图.png");

        assert_eq!(fields.dynasty.as_deref(), Some("元代"));
        assert_eq!(fields.author.as_deref(), Some("黄公望"));
        assert_eq!(fields.title, "富春山居图");
        assert_eq!(fields.category, None);
        assert_eq!(fields.technique, None);
        assert_eq!(fields.ink_color_style, None);
        assert_eq!(fields.dimensions, None);
        assert_eq!(fields.material, None);
        assert_eq!(fields.museum, None);
        assert!(fields.tags.is_empty());
    }

    #[test]
    fn test_every_short_prefix_degrades() {
        let full = "明代_仇英_汉宫春晓图_人物_工笔_青绿_30x574_绢本_台北故宫_宫廷,仕女";
        let parts: Vec<&str> = full.split('_').collect();

        for n in 1..parts.len() {
            let name = format!("{}.jpg", parts[..n].join("_"));
            let fields = parse_filename(&name);
            if n < 10 {
                assert!(fields.tags.is_empty(), "{}", name);
            }
            if n < 9 {
                assert_eq!(fields.museum, None, "{}", name);
            }
            if n < 6 {
                assert_eq!(fields.ink_color_style, None, "{}", name);
            }
            if n < 4 {
                assert_eq!(fields.category, None, "{}", name);
            }
            assert!(!fields.title.is_empty());
        }
    }

    #[test]
    fn test_title_falls_back_to_stem() {
        let fields = parse_filename("清代_石涛.jpg");
        assert_eq!(fields.title, "清代_石涛");
        assert_eq!(fields.author.as_deref(), Some("石涛"));
    }

    #[test]
    fn test_name_without_delimiter_is_a_title() {
        let fields = parse_filename("溪山行旅图.jpg");
        assert_eq!(fields.title, "溪山行旅图");
        assert_eq!(fields.dynasty, None);
        assert_eq!(fields.author, None);
    }

    #[test]
    fn test_unknown_tokens_are_null() {
        let fields = parse_filename("清代_佚名_某图_界画_泼墨_金碧.jpg");
        assert_eq!(fields.title, "某图");
        assert_eq!(fields.category, None);
        assert_eq!(fields.technique, None);
        assert_eq!(fields.ink_color_style, None);
    }

    #[test]
    fn test_empty_segments_and_tag_separators() {
        let fields = parse_filename("宋代__无题_山水_写意_水墨____松, 石，云.jpg");
        assert_eq!(fields.author, None);
        assert_eq!(fields.category, Some(Category::Landscape));
        assert_eq!(fields.technique, Some(Technique::Freehand));
        assert_eq!(fields.ink_color_style, Some(InkColorStyle::InkWash));
        assert_eq!(fields.dimensions, None);
        assert_eq!(fields.tags, vec!["松", "石", "云"]);
    }
}
