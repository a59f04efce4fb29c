//! Directory scanning and the sequential per-image loop.

use std::fs;
use std::path::{Path, PathBuf};

use image::DynamicImage;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::error::{Error, Result};
use crate::image::{load_rgb, save_image, SUPPORTED_EXTENSIONS};

/// A pretrained pipeline applied to one image at a time.
pub trait ImageModel {
    /// Verb shown on the batch progress bar, e.g. `"Upscaling"`.
    fn label(&self) -> &'static str;

    /// Produce the output image for `image`.
    ///
    /// `progress` hosts any per-image bars the model wants to show.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn process(&mut self, image: &DynamicImage, progress: &MultiProgress) -> Result<DynamicImage>;
}

/// Where and how a batch writes its results.
#[derive(Debug, Clone, Copy)]
pub struct BatchJob<'a> {
    /// Directory results are written to. Must exist.
    pub output_dir: &'a Path,
    /// Appended to each input's file stem, e.g. `"_colorized"`.
    pub suffix: &'a str,
    /// JPEG quality (1-100).
    pub quality: u8,
}

/// Outcome of a completed batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Output files, in processing order.
    pub outputs: Vec<PathBuf>,
}

/// Whether `path` has one of the accepted image extensions (case-insensitive).
#[must_use]
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// List the images directly inside `dir`, sorted by path.
///
/// Subdirectories and files with other extensions are skipped.
///
/// # Errors
///
/// Returns an error if `dir` is not an existing directory or cannot be read.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::InputDirMissing {
            path: dir.to_path_buf(),
        });
    }

    let mut images = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            images.push(path);
        }
    }
    images.sort();

    Ok(images)
}

/// The trimmed prompt, or `fallback` when nothing but whitespace was given.
#[must_use]
pub fn resolve_prompt(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Output location for `input`: same file name in `output_dir`, with
/// `suffix` inserted before the extension.
#[must_use]
pub fn output_path(input: &Path, output_dir: &Path, suffix: &str) -> PathBuf {
    let mut name = input.file_stem().unwrap_or_default().to_os_string();
    name.push(suffix);
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    output_dir.join(name)
}

/// Create the output directory and any missing parents.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn prepare_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| Error::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Run `model` over `images` in order, saving one output per input.
///
/// The first failure aborts the batch.
///
/// # Errors
///
/// Returns an error if an image cannot be loaded, processed, or saved.
pub fn run_batch<M: ImageModel + ?Sized>(
    model: &mut M,
    images: &[PathBuf],
    job: &BatchJob<'_>,
) -> Result<BatchReport> {
    let progress = MultiProgress::new();
    let pb = progress.add(ProgressBar::new(images.len() as u64));
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} {msg} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-"),
    );
    pb.set_message(model.label());

    let mut report = BatchReport::default();
    for path in images {
        tracing::debug!("Processing image: {}", path.display());

        let image = load_rgb(path)?;
        let result = model.process(&image, &progress)?;

        let out_path = output_path(path, job.output_dir, job.suffix);
        save_image(&result, &out_path, job.quality)?;
        tracing::debug!("Saved {}", out_path.display());

        report.outputs.push(out_path);
        pb.inc(1);
    }
    pb.finish();

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Inverts colours; enough to prove each image went through the model.
    struct InvertModel {
        calls: usize,
    }

    impl ImageModel for InvertModel {
        fn label(&self) -> &'static str {
            "Inverting"
        }

        fn process(&mut self, image: &DynamicImage, _: &MultiProgress) -> Result<DynamicImage> {
            self.calls += 1;
            let mut out = image.clone();
            out.invert();
            Ok(out)
        }
    }

    struct FailingModel;

    impl ImageModel for FailingModel {
        fn label(&self) -> &'static str {
            "Failing"
        }

        fn process(&mut self, _: &DynamicImage, _: &MultiProgress) -> Result<DynamicImage> {
            Err(Error::invalid("image", "rejected"))
        }
    }

    fn write_png(path: &Path) {
        image::RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(is_supported_image(Path::new("a.JPG")));
        assert!(is_supported_image(Path::new("a.jpeg")));
        assert!(is_supported_image(Path::new("dir/b.TiFf")));
        assert!(is_supported_image(Path::new("c.webp")));
        assert!(!is_supported_image(Path::new("notes.txt")));
        assert!(!is_supported_image(Path::new("gif.gif")));
        assert!(!is_supported_image(Path::new("no_extension")));
    }

    #[test]
    fn discover_sorts_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("b.png"));
        write_png(&dir.path().join("a.PNG"));
        fs::write(dir.path().join("readme.txt"), "not an image").unwrap();
        fs::create_dir(dir.path().join("nested.png")).unwrap();

        let images = discover_images(dir.path()).unwrap();
        let names: Vec<_> = images
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, ["a.PNG", "b.png"]);
    }

    #[test]
    fn discover_missing_dir_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = discover_images(&missing).unwrap_err();
        assert!(matches!(err, Error::InputDirMissing { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn discover_empty_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_images(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn prompt_fallback() {
        assert_eq!(resolve_prompt("", "high-resolution photo"), "high-resolution photo");
        assert_eq!(resolve_prompt("  \t\n", "high-resolution photo"), "high-resolution photo");
        assert_eq!(resolve_prompt("  a castle ", "fallback"), "a castle");
    }

    #[test]
    fn output_names_mirror_inputs() {
        let out = Path::new("/out");
        assert_eq!(
            output_path(Path::new("/in/photo.jpg"), out, ""),
            PathBuf::from("/out/photo.jpg")
        );
        assert_eq!(
            output_path(Path::new("/in/photo.JPG"), out, "_colorized"),
            PathBuf::from("/out/photo_colorized.JPG")
        );
        assert_eq!(
            output_path(Path::new("/in/archive.tar.png"), out, "_x"),
            PathBuf::from("/out/archive.tar_x.png")
        );
    }

    #[cfg(unix)]
    #[test]
    fn output_names_keep_non_utf8_bytes() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let input = Path::new("/in").join(OsStr::from_bytes(b"caf\xe9.png"));
        let out = output_path(&input, Path::new("/out"), "_colorized");

        assert_eq!(
            out.file_name().unwrap().as_bytes(),
            b"caf\xe9_colorized.png"
        );
    }

    #[test]
    fn prepare_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");

        prepare_output_dir(&nested).unwrap();
        assert!(nested.is_dir());
        // Idempotent.
        prepare_output_dir(&nested).unwrap();
    }

    #[test]
    fn one_output_per_image_and_nothing_else() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("one.png"));
        write_png(&input.path().join("two.png"));
        fs::write(input.path().join("skip.txt"), "x").unwrap();

        let images = discover_images(input.path()).unwrap();
        let mut model = InvertModel { calls: 0 };
        let job = BatchJob {
            output_dir: output.path(),
            suffix: "_colorized",
            quality: 95,
        };

        let report = run_batch(&mut model, &images, &job).unwrap();

        assert_eq!(model.calls, 2);
        assert_eq!(report.outputs.len(), 2);

        let mut written: Vec<_> = fs::read_dir(output.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        written.sort();
        assert_eq!(written, ["one_colorized.png", "two_colorized.png"]);

        let pixel = *image::open(output.path().join("one_colorized.png"))
            .unwrap()
            .to_rgb8()
            .get_pixel(0, 0);
        assert_eq!(pixel, image::Rgb([245, 235, 225]));
    }

    #[test]
    fn first_failure_aborts_without_writing() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        write_png(&input.path().join("one.png"));

        let images = discover_images(input.path()).unwrap();
        let job = BatchJob {
            output_dir: output.path(),
            suffix: "",
            quality: 95,
        };

        assert!(run_batch(&mut FailingModel, &images, &job).is_err());
        assert_eq!(fs::read_dir(output.path()).unwrap().count(), 0);
    }
}
