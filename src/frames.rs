use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use log::info;

use crate::display_msg::AnimationId;

/// Produces and locates the frame images of an animation.
pub trait FrameSource: Send + Sync {
    fn extract(&self, animation: AnimationId, source: &Path) -> anyhow::Result<()>;

    /// Extracts the left and right halves of one clip as two animations.
    fn extract_split(
        &self,
        left: AnimationId,
        right: AnimationId,
        source: &Path,
    ) -> anyhow::Result<()>;

    /// Frame files in playback order.
    fn list_frames(&self, animation: AnimationId) -> anyhow::Result<Vec<PathBuf>>;
}

/// Frames stored as `<root>/<animation id>/0001.png, 0002.png, ...`.
///
/// Imports take a directory of already rendered images; split imports expect
/// the halves in `left/` and `right/` below the source directory.
pub struct FrameDirectory {
    root: PathBuf,
}

impl FrameDirectory {
    pub fn new(root: impl Into<PathBuf>) -> FrameDirectory {
        FrameDirectory { root: root.into() }
    }

    fn animation_dir(&self, animation: AnimationId) -> PathBuf {
        self.root.join(animation.to_string())
    }

    fn import(&self, animation: AnimationId, source: &Path) -> anyhow::Result<()> {
        let images = sorted_images(source)?;
        if images.is_empty() {
            bail!("{} contains no frame images", source.display());
        }

        let target = self.animation_dir(animation);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;
        for (index, image) in images.iter().enumerate() {
            fs::copy(image, target.join(format!("{:04}.png", index + 1)))
                .with_context(|| format!("frame {} could not be copied", image.display()))?;
        }
        info!("imported {} frames for animation {}", images.len(), animation);
        Ok(())
    }
}

fn sorted_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("{} is not readable", dir.display()))? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("png"));
        if path.is_file() && is_png {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

impl FrameSource for FrameDirectory {
    fn extract(&self, animation: AnimationId, source: &Path) -> anyhow::Result<()> {
        self.import(animation, source)
    }

    fn extract_split(
        &self,
        left: AnimationId,
        right: AnimationId,
        source: &Path,
    ) -> anyhow::Result<()> {
        self.import(left, &source.join("left"))
            .context("left side extraction failed")?;
        self.import(right, &source.join("right"))
            .context("right side extraction failed")?;
        Ok(())
    }

    fn list_frames(&self, animation: AnimationId) -> anyhow::Result<Vec<PathBuf>> {
        sorted_images(&self.animation_dir(animation))
    }
}
