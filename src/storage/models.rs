use serde::{Deserialize, Serialize};

/// Watched state of an episode. Skipped is a local-only signal that is
/// stronger than absence on a remote service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchedState {
    #[default]
    Unwatched,
    Watched,
    Skipped,
}

impl WatchedState {
    pub fn code(&self) -> i32 {
        match self {
            WatchedState::Unwatched => 0,
            WatchedState::Watched => 1,
            WatchedState::Skipped => 2,
        }
    }

    /// Unknown codes read as unwatched.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => WatchedState::Watched,
            2 => WatchedState::Skipped,
            _ => WatchedState::Unwatched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Show {
    pub show_id: i64,
    pub tmdb_id: Option<i32>,
    pub title: String,
    pub favorite: bool,
    pub notify: bool,
    pub hidden: bool,
    pub language: Option<String>,
    pub last_updated_ms: i64,
    pub last_watched_ms: i64,
    pub rating: i32,
    pub cloud_merged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Episode {
    pub episode_id: i64,
    pub show_id: i64,
    pub season_id: i64,
    pub season_number: i32,
    pub number: i32,
    pub watched: WatchedState,
    pub plays: i32,
    pub collected: bool,
    pub rating: i32,
}

impl Episode {
    pub fn is_watched(&self) -> bool {
        self.watched == WatchedState::Watched
    }

    /// Anything the Cloud stores for this episode.
    pub fn has_flags(&self) -> bool {
        self.watched != WatchedState::Unwatched || self.collected
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Movie {
    pub tmdb_id: i32,
    pub title: String,
    pub in_collection: bool,
    pub in_watchlist: bool,
    pub watched: bool,
    pub plays: i32,
    pub rating: i32,
}

impl Movie {
    /// A movie row exists only while something references it.
    pub fn is_prunable(&self) -> bool {
        !self.in_collection && !self.in_watchlist && !self.watched && self.rating == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct List {
    pub list_id: String,
    pub name: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ListItemType {
    Show,
    Season,
    Episode,
    Movie,
}

impl ListItemType {
    pub fn code(&self) -> i32 {
        match self {
            ListItemType::Show => 1,
            ListItemType::Season => 2,
            ListItemType::Episode => 3,
            ListItemType::Movie => 4,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(ListItemType::Show),
            2 => Some(ListItemType::Season),
            3 => Some(ListItemType::Episode),
            4 => Some(ListItemType::Movie),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListItem {
    pub list_item_id: String,
    pub list_id: String,
    pub item_ref_id: String,
    pub item_type: ListItemType,
}

impl ListItem {
    pub fn new(item_ref_id: &str, item_type: ListItemType, list_id: &str) -> Self {
        Self {
            list_item_id: Self::composite_id(item_ref_id, item_type, list_id),
            list_id: list_id.to_string(),
            item_ref_id: item_ref_id.to_string(),
            item_type,
        }
    }

    /// `"{item_ref_id}-{item_type}-{list_id}"`.
    pub fn composite_id(item_ref_id: &str, item_type: ListItemType, list_id: &str) -> String {
        format!("{item_ref_id}-{}-{list_id}", item_type.code())
    }

    /// Split a composite id back into its parts. Item ref ids never contain
    /// a dash; list ids may.
    pub fn parse(list_item_id: &str) -> Option<Self> {
        let mut parts = list_item_id.splitn(3, '-');
        let item_ref_id = parts.next().filter(|s| !s.is_empty())?;
        let item_type = parts.next()?.parse::<i32>().ok().and_then(ListItemType::from_code)?;
        let list_id = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            list_item_id: list_item_id.to_string(),
            list_id: list_id.to_string(),
            item_ref_id: item_ref_id.to_string(),
            item_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watched_state_codes() {
        for state in [WatchedState::Unwatched, WatchedState::Watched, WatchedState::Skipped] {
            assert_eq!(WatchedState::from_code(state.code()), state);
        }
        assert_eq!(WatchedState::from_code(42), WatchedState::Unwatched);
    }

    #[test]
    fn test_list_item_composite_id_with_dashed_list_id() {
        let item = ListItem::new("1399", ListItemType::Show, "a1b2-c3d4");
        assert_eq!(item.list_item_id, "1399-1-a1b2-c3d4");

        let parsed = ListItem::parse(&item.list_item_id).unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn test_list_item_parse_rejects_garbage() {
        assert!(ListItem::parse("1399").is_none());
        assert!(ListItem::parse("1399-9-list").is_none());
        assert!(ListItem::parse("-1-list").is_none());
        assert!(ListItem::parse("1399-1-").is_none());
    }

    #[test]
    fn test_movie_prunable() {
        let mut movie = Movie {
            tmdb_id: 603,
            ..Default::default()
        };
        assert!(movie.is_prunable());
        movie.rating = 8;
        assert!(!movie.is_prunable());
        movie.rating = 0;
        movie.in_watchlist = true;
        assert!(!movie.is_prunable());
    }
}
