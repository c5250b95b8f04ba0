//! Palettes and animations known to the installation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus_msg::{Color, PALETTE_SLOTS};
use crate::config::LightingMood;
use crate::display_msg::AnimationId;
use crate::frames::FrameSource;
use crate::storage::Store;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("palette length cannot exceed {PALETTE_SLOTS}, but palette has {0} colors")]
    TooManyColors(usize),
    #[error("palette {0} does not exist")]
    UnknownPalette(u32),
    #[error("animation {0} does not exist")]
    UnknownAnimation(AnimationId),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Palette {
    pub id: u32,
    pub name: String,
    pub colors: Vec<Color>,
    pub moods: Vec<LightingMood>,
}

impl Palette {
    pub fn is_for(&self, mood: LightingMood) -> bool {
        self.moods.contains(&mood)
    }
}

/// Palettes used when no stored palette fits the mood.
pub fn default_palettes() -> Vec<Palette> {
    vec![Palette {
        id: 0,
        name: "Default Rainbow".to_string(),
        colors: vec![
            Color::new(255, 0, 0, 0, 0, 0),
            Color::new(255, 255, 0, 0, 0, 0),
            Color::new(0, 255, 0, 0, 0, 0),
            Color::new(0, 255, 255, 0, 0, 0),
            Color::new(0, 0, 255, 0, 0, 0),
            Color::new(255, 0, 255, 0, 0, 0),
        ],
        moods: LightingMood::ALL.to_vec(),
    }]
}

pub type PaletteMap = BTreeMap<u32, Palette>;

pub struct PaletteCatalog {
    palettes: Mutex<PaletteMap>,
    store: Box<dyn Store<PaletteMap>>,
}

impl PaletteCatalog {
    /// Loads the stored palettes, starting empty if there are none.
    pub fn load(store: Box<dyn Store<PaletteMap>>) -> PaletteCatalog {
        let palettes = store.load().unwrap_or_else(|e| {
            warn!("no palettes loaded: {:#}", e);
            PaletteMap::new()
        });
        info!("loaded {} palettes", palettes.len());
        PaletteCatalog {
            palettes: Mutex::new(palettes),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaletteMap> {
        self.palettes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `next` and only then makes it the live catalog.
    fn commit(&self, live: &mut PaletteMap, next: PaletteMap) -> Result<(), CatalogError> {
        self.store.store(&next)?;
        *live = next;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<Palette> {
        self.lock().get(&id).cloned()
    }

    /// All palettes ordered by id.
    pub fn all(&self) -> Vec<Palette> {
        self.lock().values().cloned().collect()
    }

    pub fn for_mood(&self, mood: LightingMood) -> Vec<Palette> {
        self.lock()
            .values()
            .filter(|palette| palette.is_for(mood))
            .cloned()
            .collect()
    }

    /// Creates a palette with a single blank color and returns its new id.
    pub fn create(&self, name: &str, moods: Vec<LightingMood>) -> Result<u32, CatalogError> {
        let mut palettes = self.lock();
        let id = loop {
            let candidate: u32 = rand::random();
            if !palettes.contains_key(&candidate) {
                break candidate;
            }
        };
        let mut next = palettes.clone();
        next.insert(
            id,
            Palette {
                id,
                name: name.to_string(),
                colors: vec![Color::default()],
                moods,
            },
        );
        self.commit(&mut palettes, next)?;
        Ok(id)
    }

    /// Inserts or replaces the palette with the same id.
    pub fn set(&self, palette: Palette) -> Result<(), CatalogError> {
        if palette.colors.len() > PALETTE_SLOTS {
            return Err(CatalogError::TooManyColors(palette.colors.len()));
        }
        let mut palettes = self.lock();
        let mut next = palettes.clone();
        next.insert(palette.id, palette);
        self.commit(&mut palettes, next)
    }

    pub fn remove(&self, id: u32) -> Result<Palette, CatalogError> {
        let mut palettes = self.lock();
        let mut next = palettes.clone();
        let removed = next.remove(&id).ok_or(CatalogError::UnknownPalette(id))?;
        self.commit(&mut palettes, next)?;
        Ok(removed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Animation {
    pub id: AnimationId,
    pub name: String,
    pub mood: LightingMood,
    #[serde(default)]
    pub nsfw: bool,
    /// Right half of a split clip, always played next to `id`.
    #[serde(default)]
    pub secondary: Option<AnimationId>,
}

impl Animation {
    pub fn is_split(&self) -> bool {
        self.secondary.is_some()
    }

    /// Every id that has frames on the screens.
    pub fn frame_ids(&self) -> impl Iterator<Item = AnimationId> {
        std::iter::once(self.id).chain(self.secondary)
    }
}

pub type AnimationMap = BTreeMap<AnimationId, Animation>;

pub struct AnimationCatalog {
    animations: Mutex<AnimationMap>,
    store: Box<dyn Store<AnimationMap>>,
}

impl AnimationCatalog {
    pub fn load(store: Box<dyn Store<AnimationMap>>) -> AnimationCatalog {
        let animations = store.load().unwrap_or_else(|e| {
            warn!("no animations loaded: {:#}", e);
            AnimationMap::new()
        });
        info!("loaded {} animations", animations.len());
        AnimationCatalog {
            animations: Mutex::new(animations),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AnimationMap> {
        self.animations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, live: &mut AnimationMap, next: AnimationMap) -> Result<(), CatalogError> {
        self.store.store(&next)?;
        *live = next;
        Ok(())
    }

    pub fn get(&self, id: AnimationId) -> Option<Animation> {
        self.lock().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Animation> {
        self.lock().values().cloned().collect()
    }

    /// Primary and secondary ids of every animation.
    pub fn frame_ids(&self) -> Vec<AnimationId> {
        self.lock().values().flat_map(Animation::frame_ids).collect()
    }

    fn unused_id(animations: &AnimationMap, taken: &[AnimationId]) -> AnimationId {
        loop {
            let candidate = AnimationId(rand::random());
            let in_use = animations
                .values()
                .any(|a| a.frame_ids().any(|id| id == candidate));
            if !in_use && !taken.contains(&candidate) {
                return candidate;
            }
        }
    }

    /// Extracts the frames of a clip and registers it.
    ///
    /// A split import creates both halves at once; they are only ever removed together.
    pub fn import(
        &self,
        frames: &dyn FrameSource,
        source: &Path,
        name: &str,
        mood: LightingMood,
        split: bool,
        nsfw: bool,
    ) -> Result<Animation, CatalogError> {
        let (id, secondary) = {
            let animations = self.lock();
            let id = Self::unused_id(&animations, &[]);
            let secondary = split.then(|| Self::unused_id(&animations, &[id]));
            (id, secondary)
        };

        match secondary {
            Some(right) => frames.extract_split(id, right, source)?,
            None => frames.extract(id, source)?,
        }

        let animation = Animation {
            id,
            name: name.to_string(),
            mood,
            nsfw,
            secondary,
        };
        let mut animations = self.lock();
        let mut next = animations.clone();
        next.insert(id, animation.clone());
        self.commit(&mut animations, next)?;
        info!("imported animation {} ({})", id, name);
        Ok(animation)
    }

    pub fn update(
        &self,
        id: AnimationId,
        name: &str,
        mood: LightingMood,
        nsfw: bool,
    ) -> Result<Animation, CatalogError> {
        let mut animations = self.lock();
        let mut next = animations.clone();
        let animation = next
            .get_mut(&id)
            .ok_or(CatalogError::UnknownAnimation(id))?;
        animation.name = name.to_string();
        animation.mood = mood;
        animation.nsfw = nsfw;
        let updated = animation.clone();
        self.commit(&mut animations, next)?;
        Ok(updated)
    }

    /// Removes the animation together with its secondary half.
    pub fn remove(&self, id: AnimationId) -> Result<Animation, CatalogError> {
        let mut animations = self.lock();
        let mut next = animations.clone();
        let removed = next
            .remove(&id)
            .ok_or(CatalogError::UnknownAnimation(id))?;
        self.commit(&mut animations, next)?;
        Ok(removed)
    }
}
