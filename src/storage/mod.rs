mod annotations;
mod items;
mod listings;
mod schema;
mod search;
mod types;

pub use schema::Database;
pub use types::{
    Annotation, Category, DictionaryItem, DictionaryType, IndexConsistencyReport, Item, NewItem,
    SearchFilters, SortDirection, SortOption, StorageError, UnknownDictionaryType,
    DEFAULT_SEARCH_LIMIT, HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN,
};
