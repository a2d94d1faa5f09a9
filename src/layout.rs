//! Page/question arrangement strings.
//!
//! A layout is a comma-joined list of ids where `0` ends a page, e.g.
//! `"3,5,0,7,0"` is two pages. Every layout produced here ends with `0`.
//! Structural edits never fail: an index or id that does not fit leaves the
//! layout unchanged.

use std::collections::HashSet;

use crate::random::RandomSource;

pub const PAGE_BREAK: i64 = 0;

/// Splits a layout into items. Empty or non-numeric items are dropped.
pub fn parse(layout: &str) -> Vec<i64> {
    layout
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

pub fn join(items: &[i64]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

pub fn clean(layout: &str, remove_empty_pages: bool) -> String {
    let mut seen = HashSet::new();
    let mut cleaner: Vec<i64> = Vec::new();
    for item in parse(layout) {
        if item == PAGE_BREAK {
            cleaner.push(PAGE_BREAK);
        } else if seen.insert(item) {
            cleaner.push(item);
        }
    }

    if remove_empty_pages {
        let items = std::mem::take(&mut cleaner);
        // Start true so that leading breaks are stripped too.
        let mut strip_following_breaks = true;
        for item in items {
            if strip_following_breaks && item == PAGE_BREAK {
                continue;
            }
            cleaner.push(item);
            strip_following_breaks = item == PAGE_BREAK;
        }
    }

    if cleaner.last() != Some(&PAGE_BREAK) {
        cleaner.push(PAGE_BREAK);
    }
    join(&cleaner)
}

/// Question ids in layout order, without page breaks.
pub fn questions(layout: &str) -> Vec<i64> {
    parse(layout)
        .into_iter()
        .filter(|&i| i != PAGE_BREAK)
        .collect()
}

pub fn repaginate(
    layout: &str,
    per_page: usize,
    shuffle: Option<&mut dyn RandomSource>,
) -> String {
    let mut ids = questions(layout);
    if ids.is_empty() {
        return "0".to_string();
    }
    if let Some(rng) = shuffle {
        rng.shuffle(&mut ids);
    }

    let mut out = Vec::with_capacity(ids.len() * 2);
    let mut on_this_page = 0;
    for id in ids {
        if per_page > 0 && on_this_page >= per_page {
            out.push(PAGE_BREAK);
            on_this_page = 0;
        }
        out.push(id);
        on_this_page += 1;
    }
    out.push(PAGE_BREAK);
    join(&out)
}

pub fn number_of_pages(layout: &str) -> usize {
    parse(&clean(layout, false))
        .into_iter()
        .filter(|&i| i == PAGE_BREAK)
        .count()
}

pub fn number_of_questions(layout: &str) -> usize {
    questions(&clean(layout, false)).len()
}

/// Pages as lists of ids. Always at least one (possibly empty) page.
pub fn pages(layout: &str) -> Vec<Vec<i64>> {
    let mut pages = Vec::new();
    let mut current = Vec::new();
    for item in parse(&clean(layout, false)) {
        if item == PAGE_BREAK {
            pages.push(std::mem::take(&mut current));
        } else {
            current.push(item);
        }
    }
    if pages.is_empty() {
        pages.push(Vec::new());
    }
    pages
}

/// Inserts a page break before the item at `index`.
pub fn add_page_break_at(layout: &str, index: i64) -> String {
    let mut items = parse(layout);
    if index < 0 || index as usize >= items.len() {
        return layout.to_string();
    }
    items.insert(index as usize, PAGE_BREAK);
    join(&items)
}

pub fn add_page_break_after(layout: &str, question_id: i64) -> String {
    let mut items = parse(layout);
    if question_id == PAGE_BREAK {
        return layout.to_string();
    }
    let Some(key) = items.iter().position(|&i| i == question_id) else {
        return layout.to_string();
    };
    items.insert(key + 1, PAGE_BREAK);
    join(&items)
}

/// Removes the empty page that starts after item `index` (`-1` for the first page).
pub fn delete_empty_page(layout: &str, index: i64) -> String {
    let mut items = parse(layout);
    if index < -1 || index >= items.len() as i64 - 1 {
        return layout.to_string();
    }
    let next = (index + 1) as usize;
    // The trailing break is never removed; an empty last page drops the break before it.
    if next == items.len() - 1 {
        if index >= 0 && items[index as usize] == PAGE_BREAK && items[next] == PAGE_BREAK {
            items.remove(index as usize);
            return join(&items);
        }
        return layout.to_string();
    }
    if (index >= 0 && items[index as usize] != PAGE_BREAK) || items[next] != PAGE_BREAK {
        return layout.to_string();
    }
    items.remove(next);
    join(&items)
}

/// Swaps a question with its neighbour. Moving across a page break moves the
/// question onto the adjacent page. The trailing break never moves.
pub fn move_question(layout: &str, question_id: i64, shift: i64) -> String {
    if question_id == PAGE_BREAK || !(shift == 1 || shift == -1) {
        return layout.to_string();
    }
    let mut items = parse(layout);
    let Some(key) = items.iter().position(|&i| i == question_id) else {
        return layout.to_string();
    };
    let other = key as i64 + shift;
    if other < 0 || other >= items.len() as i64 - 1 {
        return layout.to_string();
    }
    items.swap(key, other as usize);
    join(&items)
}

/// Moves the page break at `index` one item left or right.
pub fn move_page_break(layout: &str, index: i64, shift: i64) -> String {
    if !(shift == 1 || shift == -1) {
        return layout.to_string();
    }
    let mut items = parse(layout);
    let len = items.len() as i64;
    // The terminal break is the sentinel, never a movable break.
    if index < 0 || index >= len - 1 || items[index as usize] != PAGE_BREAK {
        return layout.to_string();
    }
    let other = index + shift;
    if other < 0 || other >= len - 1 {
        return layout.to_string();
    }
    items.swap(index as usize, other as usize);
    join(&items)
}

/// Ids that occur more than once, in first-duplicate order.
pub fn duplicate_ids(layout: &str) -> Vec<i64> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for id in questions(layout) {
        if !seen.insert(id) && !dups.contains(&id) {
            dups.push(id);
        }
    }
    dups
}
