//! Heuristic category determination
//!
//! Category assignment trusts the request intent first: a batch fetched under
//! the category strategy already names its category. Everything else runs
//! through a data-driven keyword table. The built-in term lists are the
//! deployment's Chinese vocabulary and are matched verbatim against tag and
//! description text, which the API mostly returns in English; those records
//! usually score below the confidence floor and take the random fallback.
//! Operators can swap in their own term lists via `[categories.terms]`.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use tracing::warn;

use crate::harvester::api_client::PhotoRecord;
use crate::harvester::config_loader::CategoriesSection;
use crate::harvester::strategy::FetchStrategy;

/// Confidence floor below which the dictionary result is discarded.
const CONFIDENCE_FLOOR: f64 = 0.3;
/// Confidence pinned onto random fallback assignments.
const FALLBACK_CONFIDENCE: f64 = 0.1;
/// Stored assignments below this trigger a warning.
const LOW_CONFIDENCE_WARN: f64 = 0.5;

/// Slug, display name, and classifier terms of the built-in categories.
/// Display names label the on-disk directories.
const BUILT_IN: &[(&str, &str, &[&str])] = &[
    ("backgrounds", "背景", &["背景", "壁纸", "纹理"]),
    ("fashion", "时尚", &["时尚", "服装", "穿搭"]),
    ("nature", "自然", &["自然", "风景", "山", "森林"]),
    ("science", "科学", &["科学", "实验", "研究"]),
    ("education", "教育", &["教育", "学习", "课堂"]),
    ("feelings", "情感", &["情感", "心情", "爱"]),
    ("health", "健康", &["健康", "瑜伽", "医疗"]),
    ("people", "人物", &["人物", "肖像", "人像"]),
    ("religion", "宗教", &["宗教", "寺庙", "教堂"]),
    ("places", "地点", &["地点", "城市", "街道"]),
    ("animals", "动物", &["动物", "猫", "狗", "鸟"]),
    ("industry", "工业", &["工业", "工厂", "机械"]),
    ("computer", "计算机", &["计算机", "电脑", "代码"]),
    ("food", "食物", &["食物", "美食", "咖啡"]),
    ("sports", "运动", &["运动", "体育", "健身"]),
    ("transportation", "交通", &["交通", "汽车", "火车"]),
    ("travel", "旅行", &["旅行", "旅游", "度假"]),
    ("buildings", "建筑", &["建筑", "高楼", "桥"]),
    ("business", "商业", &["商业", "办公", "会议"]),
    ("music", "音乐", &["音乐", "乐器", "吉他"]),
];

const FALLBACK_SLUG: &str = "other";
const FALLBACK_NAME: &str = "其他";

static DEFAULT_TABLE: Lazy<CategoryTable> = Lazy::new(CategoryTable::built_in);

/// One known category with its classifier vocabulary.
#[derive(Debug, Clone)]
pub struct Category {
    pub slug: String,
    pub name: String,
    pub terms: Vec<String>,
}

/// Ordered category table. Declaration order is the classification tie-break.
#[derive(Debug, Clone)]
pub struct CategoryTable {
    categories: Vec<Category>,
    fallback: Category,
}

impl CategoryTable {
    pub fn new(categories: Vec<Category>) -> Self {
        let categories = categories
            .into_iter()
            .map(|mut category| {
                for term in &mut category.terms {
                    *term = term.to_lowercase();
                }
                category
            })
            .collect();

        Self {
            categories,
            fallback: Category {
                slug: FALLBACK_SLUG.to_string(),
                name: FALLBACK_NAME.to_string(),
                terms: Vec::new(),
            },
        }
    }

    fn built_in() -> Self {
        Self::new(
            BUILT_IN
                .iter()
                .map(|(slug, name, terms)| Category {
                    slug: (*slug).to_string(),
                    name: (*name).to_string(),
                    terms: terms.iter().map(|t| (*t).to_string()).collect(),
                })
                .collect(),
        )
    }

    /// Built-in table with any configured overrides applied. Unknown slugs in
    /// the overrides become additional categories.
    pub fn from_config(section: &CategoriesSection) -> Self {
        let mut table = DEFAULT_TABLE.clone();

        for (slug, name) in &section.names {
            if slug == FALLBACK_SLUG {
                table.fallback.name = name.clone();
            } else if let Some(category) =
                table.categories.iter_mut().find(|c| &c.slug == slug)
            {
                category.name = name.clone();
            } else {
                table.categories.push(Category {
                    slug: slug.clone(),
                    name: name.clone(),
                    terms: Vec::new(),
                });
            }
        }

        for (slug, terms) in &section.terms {
            let terms: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
            if let Some(category) = table.categories.iter_mut().find(|c| &c.slug == slug) {
                category.terms = terms;
            } else if slug != FALLBACK_SLUG {
                table.categories.push(Category {
                    slug: slug.clone(),
                    name: slug.clone(),
                    terms,
                });
            }
        }

        table
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.categories.iter().any(|c| c.slug == slug)
    }

    pub fn display_name(&self, slug: &str) -> Option<&str> {
        self.categories
            .iter()
            .find(|c| c.slug == slug)
            .map(|c| c.name.as_str())
    }

    /// Fallback bucket for records whose request slug is not in the table.
    pub fn fallback(&self) -> &Category {
        &self.fallback
    }

    pub fn random_category(&self) -> Option<&Category> {
        self.categories.choose(&mut rand::thread_rng())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Outcome of a classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub slug: String,
    pub name: String,
    pub confidence: f64,
}

/// Pure classifier over a category table.
#[derive(Debug, Clone)]
pub struct Categorizer {
    table: CategoryTable,
}

impl Categorizer {
    pub fn new(table: CategoryTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &CategoryTable {
        &self.table
    }

    /// Map a record (plus the strategy and keyword that fetched it) to a
    /// category and confidence score.
    pub fn classify(
        &self,
        photo: &PhotoRecord,
        strategy: FetchStrategy,
        keyword: Option<&str>,
    ) -> Classification {
        // Request intent is authoritative for category-strategy batches.
        if strategy == FetchStrategy::Category {
            if let Some(slug) = keyword {
                if let Some(name) = self.table.display_name(slug) {
                    return Classification {
                        slug: slug.to_string(),
                        name: name.to_string(),
                        confidence: 1.0,
                    };
                }
            }
        }

        let tags: Vec<String> = photo
            .tag_titles()
            .into_iter()
            .map(|t| t.to_lowercase())
            .collect();
        let description = photo.description_text().to_lowercase();

        let classification = match self.score(&tags, &description) {
            Some(classification) => classification,
            None => self.random_fallback(),
        };

        if classification.confidence < LOW_CONFIDENCE_WARN {
            warn!(
                image_id = %photo.id,
                slug = %classification.slug,
                confidence = classification.confidence,
                "Low-confidence category assignment"
            );
        }

        classification
    }

    /// Dictionary scoring: +2 per tag any of a category's terms appears in,
    /// +1 per term appearing in the description. Ties keep the
    /// first-declared category. Returns None when the normalized confidence
    /// falls below the floor.
    fn score(&self, tags: &[String], description: &str) -> Option<Classification> {
        let mut best: Option<(&Category, u32)> = None;

        for category in self.table.iter() {
            let mut score = 0u32;

            for tag in tags {
                if category.terms.iter().any(|term| tag.contains(term)) {
                    score += 2;
                }
            }
            for term in &category.terms {
                if !term.is_empty() && description.contains(term) {
                    score += 1;
                }
            }

            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ if score == 0 => {}
                _ => best = Some((category, score)),
            }
        }

        let (category, score) = best?;

        let word_count = description.split_whitespace().count();
        let denominator = (tags.len() as f64 * 2.0 + word_count as f64 / 10.0).max(1.0);
        let confidence = f64::from(score) / denominator;

        if confidence < CONFIDENCE_FLOOR {
            return None;
        }

        Some(Classification {
            slug: category.slug.clone(),
            name: category.name.clone(),
            confidence,
        })
    }

    fn random_fallback(&self) -> Classification {
        match self.table.random_category() {
            Some(category) => Classification {
                slug: category.slug.clone(),
                name: category.name.clone(),
                confidence: FALLBACK_CONFIDENCE,
            },
            None => {
                let fallback = self.table.fallback();
                Classification {
                    slug: fallback.slug.clone(),
                    name: fallback.name.clone(),
                    confidence: FALLBACK_CONFIDENCE,
                }
            }
        }
    }
}
