//! File classification and destination placement.
//!
//! Classification is a pure function of the file path and the first bytes of
//! its content (read by the caller with [`read_sniff`]). It never fails:
//! anything it cannot place resolves to `Category::Unknown` with flat placement.
//!
//! Lookup order for an extension:
//! 1. legacy signatures gated by a magic-byte sniff (extensions that collide
//!    with modern or generic formats)
//! 2. the modern extension table
//! 3. legacy signatures matched by extension alone
//! 4. content-only signatures, for missing or unrecognised extensions

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{Category, FileRecord, PlacementRule};

/// Bytes a caller should read from the start of a file before classifying.
pub const SNIFF_LEN: usize = 2048;

/// Legacy file formats recognised by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyFormat {
    // word processing
    WordPerfect,
    WordStar,
    AmiPro,
    LotusWordPro,
    MicrosoftWorks,
    StarOffice,
    ClarisWorks,
    MacWrite,
    XyWrite,
    MultiMate,
    // spreadsheets
    Lotus123,
    QuattroPro,
    VisiCalc,
    // databases
    DBase,
    AccessLegacy,
    FileMaker,
    LotusApproach,
    // presentations
    HarvardGraphics,
    CorelPresentations,
    LotusFreelance,
    // desktop publishing
    PageMaker,
    QuarkXPress,
    // images
    Pcx,
    Targa,
    CorelDraw,
    WindowsMetafile,
    EnhancedMetafile,
    Pict,
    SgiImage,
    AmigaIff,
    MacPaint,
    KodakPhotoCd,
    Photoshop,
    PaintShopPro,
    // video
    AdvancedSystemsFormat,
    RealMedia,
    DvdVob,
    DivX,
    Flash,
    VideoCd,
    CamcorderMod,
    QuickTimeLegacy,
    Flic,
    // audio
    Midi,
    TrackerModule,
    CreativeVoice,
    CdAudioTrack,
    RealAudio,
    // archives
    Arj,
    Lha,
    Cabinet,
    Ace,
    StuffIt,
    Zoo,
    Arc,
}

/// Broad family of a legacy format, used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyKind {
    Document,
    Spreadsheet,
    Database,
    Presentation,
    Publishing,
    Image,
    Video,
    Audio,
    Archive,
}

impl LegacyFormat {
    /// Human-readable name; also the directory name under `Legacy/`.
    pub fn name(&self) -> &'static str {
        use LegacyFormat::*;
        match self {
            WordPerfect => "WordPerfect",
            WordStar => "WordStar",
            AmiPro => "Ami Pro",
            LotusWordPro => "Lotus Word Pro",
            MicrosoftWorks => "Microsoft Works",
            StarOffice => "StarOffice",
            ClarisWorks => "ClarisWorks",
            MacWrite => "MacWrite",
            XyWrite => "XyWrite",
            MultiMate => "MultiMate",
            Lotus123 => "Lotus 1-2-3",
            QuattroPro => "Quattro Pro",
            VisiCalc => "VisiCalc",
            DBase => "dBase",
            AccessLegacy => "Access (Jet)",
            FileMaker => "FileMaker",
            LotusApproach => "Lotus Approach",
            HarvardGraphics => "Harvard Graphics",
            CorelPresentations => "Corel Presentations",
            LotusFreelance => "Lotus Freelance",
            PageMaker => "PageMaker",
            QuarkXPress => "QuarkXPress",
            Pcx => "PCX",
            Targa => "Targa",
            CorelDraw => "CorelDRAW",
            WindowsMetafile => "Windows Metafile",
            EnhancedMetafile => "Enhanced Metafile",
            Pict => "PICT",
            SgiImage => "SGI Image",
            AmigaIff => "Amiga IFF",
            MacPaint => "MacPaint",
            KodakPhotoCd => "Kodak Photo CD",
            Photoshop => "Photoshop",
            PaintShopPro => "Paint Shop Pro",
            AdvancedSystemsFormat => "ASF",
            RealMedia => "RealMedia",
            DvdVob => "DVD VOB",
            DivX => "DivX",
            Flash => "Flash",
            VideoCd => "Video CD",
            CamcorderMod => "Camcorder MOD",
            QuickTimeLegacy => "QuickTime (legacy)",
            Flic => "FLIC",
            Midi => "MIDI",
            TrackerModule => "Tracker Module",
            CreativeVoice => "Creative Voice",
            CdAudioTrack => "CD Audio Track",
            RealAudio => "RealAudio",
            Arj => "ARJ",
            Lha => "LHA",
            Cabinet => "Cabinet",
            Ace => "ACE",
            StuffIt => "StuffIt",
            Zoo => "Zoo",
            Arc => "ARC",
        }
    }

    pub fn kind(&self) -> LegacyKind {
        use LegacyFormat::*;
        match self {
            WordPerfect | WordStar | AmiPro | LotusWordPro | MicrosoftWorks | StarOffice
            | ClarisWorks | MacWrite | XyWrite | MultiMate => LegacyKind::Document,
            Lotus123 | QuattroPro | VisiCalc => LegacyKind::Spreadsheet,
            DBase | AccessLegacy | FileMaker | LotusApproach => LegacyKind::Database,
            HarvardGraphics | CorelPresentations | LotusFreelance => LegacyKind::Presentation,
            PageMaker | QuarkXPress => LegacyKind::Publishing,
            Pcx | Targa | CorelDraw | WindowsMetafile | EnhancedMetafile | Pict | SgiImage
            | AmigaIff | MacPaint | KodakPhotoCd | Photoshop | PaintShopPro => LegacyKind::Image,
            AdvancedSystemsFormat | RealMedia | DvdVob | DivX | Flash | VideoCd | CamcorderMod
            | QuickTimeLegacy | Flic => LegacyKind::Video,
            Midi | TrackerModule | CreativeVoice | CdAudioTrack | RealAudio => LegacyKind::Audio,
            Arj | Lha | Cabinet | Ace | StuffIt | Zoo | Arc => LegacyKind::Archive,
        }
    }
}

impl fmt::Display for LegacyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bytes expected at a fixed offset of a file.
#[derive(Debug, Clone, Copy)]
pub struct Magic {
    pub offset: usize,
    pub bytes: &'static [u8],
}

impl Magic {
    const fn at(offset: usize, bytes: &'static [u8]) -> Self {
        Magic { offset, bytes }
    }

    pub fn matches(&self, sniff: &[u8]) -> bool {
        sniff
            .get(self.offset..self.offset + self.bytes.len())
            .map_or(false, |window| window == self.bytes)
    }
}

/// One registry entry: an extension, and the sniff that must also match
/// when the extension is shared with another format.
#[derive(Debug, Clone, Copy)]
pub struct LegacySignature {
    pub extension: &'static str,
    pub format: LegacyFormat,
    pub gate: Option<Magic>,
}

const fn ext(extension: &'static str, format: LegacyFormat) -> LegacySignature {
    LegacySignature {
        extension,
        format,
        gate: None,
    }
}

const fn gated(extension: &'static str, format: LegacyFormat, gate: Magic) -> LegacySignature {
    LegacySignature {
        extension,
        format,
        gate: Some(gate),
    }
}

const WPC_MAGIC: Magic = Magic::at(0, &[0xFF, b'W', b'P', b'C']);
const MPEG_PS_MAGIC: Magic = Magic::at(0, &[0x00, 0x00, 0x01, 0xBA]);

/// Known legacy signatures.
pub static LEGACY_SIGNATURES: &[LegacySignature] = &[
    // collisions, resolved by sniff
    gated("doc", LegacyFormat::WordPerfect, WPC_MAGIC),
    gated("dat", LegacyFormat::VideoCd, Magic::at(8, b"CDXA")),
    gated("mod", LegacyFormat::TrackerModule, Magic::at(1080, b"M.K.")),
    gated("mod", LegacyFormat::CamcorderMod, MPEG_PS_MAGIC),
    gated("wks", LegacyFormat::Lotus123, Magic::at(0, &[0x00, 0x00, 0x02, 0x00])),
    gated("pic", LegacyFormat::Pict, Magic::at(522, &[0x00, 0x11, 0x02, 0xFF])),
    // word processing
    ext("wpd", LegacyFormat::WordPerfect),
    ext("wp", LegacyFormat::WordPerfect),
    ext("wp5", LegacyFormat::WordPerfect),
    ext("wp6", LegacyFormat::WordPerfect),
    ext("ws", LegacyFormat::WordStar),
    ext("wsd", LegacyFormat::WordStar),
    ext("sam", LegacyFormat::AmiPro),
    ext("lwp", LegacyFormat::LotusWordPro),
    ext("wps", LegacyFormat::MicrosoftWorks),
    ext("wdb", LegacyFormat::MicrosoftWorks),
    ext("wks", LegacyFormat::MicrosoftWorks),
    ext("sxw", LegacyFormat::StarOffice),
    ext("sxc", LegacyFormat::StarOffice),
    ext("sxi", LegacyFormat::StarOffice),
    ext("sdw", LegacyFormat::StarOffice),
    ext("cwk", LegacyFormat::ClarisWorks),
    ext("mcw", LegacyFormat::MacWrite),
    ext("xy", LegacyFormat::XyWrite),
    ext("dox", LegacyFormat::MultiMate),
    // spreadsheets
    ext("123", LegacyFormat::Lotus123),
    ext("wk1", LegacyFormat::Lotus123),
    ext("wk3", LegacyFormat::Lotus123),
    ext("wk4", LegacyFormat::Lotus123),
    ext("qpw", LegacyFormat::QuattroPro),
    ext("wb1", LegacyFormat::QuattroPro),
    ext("wb2", LegacyFormat::QuattroPro),
    ext("wq1", LegacyFormat::QuattroPro),
    ext("vc", LegacyFormat::VisiCalc),
    // databases
    ext("dbf", LegacyFormat::DBase),
    ext("mdb", LegacyFormat::AccessLegacy),
    ext("fp3", LegacyFormat::FileMaker),
    ext("fp5", LegacyFormat::FileMaker),
    ext("apr", LegacyFormat::LotusApproach),
    // presentations
    ext("ch3", LegacyFormat::HarvardGraphics),
    ext("prs", LegacyFormat::HarvardGraphics),
    ext("shw", LegacyFormat::CorelPresentations),
    ext("prz", LegacyFormat::LotusFreelance),
    ext("pre", LegacyFormat::LotusFreelance),
    // desktop publishing
    ext("pm4", LegacyFormat::PageMaker),
    ext("pm5", LegacyFormat::PageMaker),
    ext("pm6", LegacyFormat::PageMaker),
    ext("p65", LegacyFormat::PageMaker),
    ext("qxd", LegacyFormat::QuarkXPress),
    // images
    ext("pcx", LegacyFormat::Pcx),
    ext("tga", LegacyFormat::Targa),
    ext("cdr", LegacyFormat::CorelDraw),
    ext("wmf", LegacyFormat::WindowsMetafile),
    ext("emf", LegacyFormat::EnhancedMetafile),
    ext("pict", LegacyFormat::Pict),
    ext("pct", LegacyFormat::Pict),
    ext("sgi", LegacyFormat::SgiImage),
    ext("rgb", LegacyFormat::SgiImage),
    ext("iff", LegacyFormat::AmigaIff),
    ext("lbm", LegacyFormat::AmigaIff),
    ext("mac", LegacyFormat::MacPaint),
    ext("pntg", LegacyFormat::MacPaint),
    ext("pcd", LegacyFormat::KodakPhotoCd),
    ext("psd", LegacyFormat::Photoshop),
    ext("psp", LegacyFormat::PaintShopPro),
    // video
    ext("asf", LegacyFormat::AdvancedSystemsFormat),
    ext("rm", LegacyFormat::RealMedia),
    ext("rmvb", LegacyFormat::RealMedia),
    ext("vob", LegacyFormat::DvdVob),
    ext("divx", LegacyFormat::DivX),
    ext("swf", LegacyFormat::Flash),
    ext("tod", LegacyFormat::CamcorderMod),
    ext("qt", LegacyFormat::QuickTimeLegacy),
    ext("fli", LegacyFormat::Flic),
    ext("flc", LegacyFormat::Flic),
    // audio
    ext("mid", LegacyFormat::Midi),
    ext("midi", LegacyFormat::Midi),
    ext("s3m", LegacyFormat::TrackerModule),
    ext("xm", LegacyFormat::TrackerModule),
    ext("it", LegacyFormat::TrackerModule),
    ext("voc", LegacyFormat::CreativeVoice),
    ext("cda", LegacyFormat::CdAudioTrack),
    ext("ra", LegacyFormat::RealAudio),
    // archives
    ext("arj", LegacyFormat::Arj),
    ext("lzh", LegacyFormat::Lha),
    ext("lha", LegacyFormat::Lha),
    ext("cab", LegacyFormat::Cabinet),
    ext("ace", LegacyFormat::Ace),
    ext("sit", LegacyFormat::StuffIt),
    ext("sitx", LegacyFormat::StuffIt),
    ext("zoo", LegacyFormat::Zoo),
    ext("arc", LegacyFormat::Arc),
];

/// Signatures distinctive enough to classify a file by content alone.
static CONTENT_SIGNATURES: &[(Magic, LegacyFormat)] = &[
    (WPC_MAGIC, LegacyFormat::WordPerfect),
    (Magic::at(0, b".RMF"), LegacyFormat::RealMedia),
    (Magic::at(0, &[0x2E, 0x72, 0x61, 0xFD]), LegacyFormat::RealAudio),
    (Magic::at(0, b"MThd"), LegacyFormat::Midi),
    (Magic::at(0, b"Creative Voice File"), LegacyFormat::CreativeVoice),
    (Magic::at(0, b"MSCF"), LegacyFormat::Cabinet),
    (Magic::at(7, b"**ACE**"), LegacyFormat::Ace),
    (Magic::at(0, b"StuffIt "), LegacyFormat::StuffIt),
    (Magic::at(0, b"SIT!"), LegacyFormat::StuffIt),
    (Magic::at(0, b"ZOO "), LegacyFormat::Zoo),
    (
        Magic::at(0, &[0x30, 0x26, 0xB2, 0x75, 0x8E, 0x66, 0xCF, 0x11]),
        LegacyFormat::AdvancedSystemsFormat,
    ),
    (Magic::at(8, b"CDXA"), LegacyFormat::VideoCd),
    (Magic::at(1080, b"M.K."), LegacyFormat::TrackerModule),
];

fn modern_category(extension: &str) -> Option<Category> {
    let category = match extension {
        "pdf" | "doc" | "docx" | "txt" | "rtf" | "odt" | "xls" | "xlsx" | "csv" | "ods"
        | "ppt" | "pptx" | "odp" | "md" | "pages" | "numbers" | "key" => Category::Document,
        "jpg" | "jpeg" | "png" | "gif" | "bmp" | "tiff" | "tif" | "webp" | "svg" | "ico"
        | "heic" | "heif" | "raw" | "cr2" | "nef" | "dng" | "arw" => Category::Image,
        "mp4" | "avi" | "mov" | "wmv" | "flv" | "mkv" | "webm" | "m4v" | "3gp" | "mpg"
        | "mpeg" | "m2v" | "mts" => Category::Video,
        "mp3" | "wav" | "flac" | "aac" | "ogg" | "wma" | "m4a" | "opus" | "aiff" | "au" => {
            Category::Audio
        }
        "zip" | "rar" | "7z" | "tar" | "gz" => Category::Archive,
        _ => return None,
    };
    Some(category)
}

/// Lower-cased extension of a path, without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Read up to [`SNIFF_LEN`] bytes from the start of a file.
pub fn read_sniff(path: &Path) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(SNIFF_LEN);
    File::open(path)?
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Options that shape placement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierOptions {
    /// Date-bucket photos, videos and audio by last-modified year/month
    pub date_folders: bool,
}

/// Maps files to a category and a placement rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    options: ClassifierOptions,
}

impl Classifier {
    pub fn new(options: ClassifierOptions) -> Self {
        Classifier { options }
    }

    /// Classify a file. Total: unknown input yields `(Unknown, Flat)`.
    pub fn classify(&self, path: &Path, sniff: &[u8]) -> (Category, PlacementRule) {
        let category = categorize(path, sniff);
        (category, self.placement_for(category))
    }

    /// Placement rule for a category under these options.
    pub fn placement_for(&self, category: Category) -> PlacementRule {
        match category {
            Category::Image | Category::Video | Category::Audio if self.options.date_folders => {
                PlacementRule::DateBucketed
            }
            Category::Image
            | Category::Video
            | Category::Audio
            | Category::Document
            | Category::Archive
            | Category::LegacyFormat(_) => PlacementRule::PreserveRelativePath,
            Category::Unknown => PlacementRule::Flat,
        }
    }
}

fn categorize(path: &Path, sniff: &[u8]) -> Category {
    let extension = extension_of(path);

    if let Some(extension) = extension.as_deref() {
        let mut gated_miss = false;
        for signature in LEGACY_SIGNATURES
            .iter()
            .filter(|s| s.extension == extension)
        {
            if let Some(gate) = signature.gate {
                if gate.matches(sniff) {
                    return Category::LegacyFormat(signature.format);
                }
                gated_miss = true;
            }
        }

        if let Some(category) = modern_category(extension) {
            return category;
        }

        if let Some(signature) = LEGACY_SIGNATURES
            .iter()
            .find(|s| s.extension == extension && s.gate.is_none())
        {
            return Category::LegacyFormat(signature.format);
        }

        if gated_miss {
            debug!(path = %path.display(), extension, "ambiguous extension, no signature matched");
            return Category::Unknown;
        }
    }

    CONTENT_SIGNATURES
        .iter()
        .find(|(magic, _)| magic.matches(sniff))
        .map_or(Category::Unknown, |(_, format)| Category::LegacyFormat(*format))
}

/// Destination for a record under a placement rule, before disambiguation.
pub fn destination_for(
    record: &FileRecord,
    placement: PlacementRule,
    destination_root: &Path,
) -> PathBuf {
    let mut base = destination_root.join(record.category.directory_name());
    if let Category::LegacyFormat(format) = record.category {
        base.push(format.name());
    }

    let file_name = record
        .source_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("unnamed"));

    match placement {
        PlacementRule::Flat => base.join(file_name),
        PlacementRule::DateBucketed => base
            .join(record.modified.format("%Y").to_string())
            .join(record.modified.format("%m").to_string())
            .join(file_name),
        PlacementRule::PreserveRelativePath => {
            let root_name = record
                .source_root
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("root"));
            base.join(root_name).join(record.relative_path())
        }
    }
}

/// First free variant of `desired`: `name.ext`, then `name_1.ext`, `name_2.ext`, ...
pub fn disambiguate(desired: &Path, is_taken: impl Fn(&Path) -> bool) -> PathBuf {
    if !is_taken(desired) {
        return desired.to_path_buf();
    }

    let stem = desired.file_stem().unwrap_or_default();
    let extension = desired.extension();

    (1u64..)
        .map(|n| {
            let mut name = stem.to_os_string();
            name.push(format!("_{}", n));
            if let Some(extension) = extension {
                name.push(".");
                name.push(extension);
            }
            desired.with_file_name(name)
        })
        .find(|candidate| !is_taken(candidate))
        .unwrap_or_else(|| desired.to_path_buf())
}
