use tracing::instrument;

const ELLIPSIS: char = '\u{2026}';
const KATAKANA_MIDDLE_DOT: char = '\u{30fb}';

const HALF_WIDTH_FIRST: u32 = '!' as u32;
const HALF_WIDTH_LAST: u32 = '~' as u32;
const FULL_WIDTH_OFFSET: u32 = 0xFEE0;

/// `!`..=`~` mapped one-to-one onto U+FF01..=U+FF5E.
static FULL_WIDTH: [char; (HALF_WIDTH_LAST - HALF_WIDTH_FIRST + 1) as usize] = full_width_table();

const fn full_width_table() -> [char; (HALF_WIDTH_LAST - HALF_WIDTH_FIRST + 1) as usize] {
    let mut table = ['\u{FFFD}'; (HALF_WIDTH_LAST - HALF_WIDTH_FIRST + 1) as usize];
    let mut i = 0;
    while i < table.len() {
        if let Some(ch) = char::from_u32(HALF_WIDTH_FIRST + i as u32 + FULL_WIDTH_OFFSET) {
            table[i] = ch;
        }
        i += 1;
    }
    table
}

/// Normalizes raw decoder output into the form shown to the reader.
///
/// Japanese OCR output is not space-delimited, so all whitespace is dropped. Ellipses and
/// runs of dots become ASCII periods before the final half-width to full-width pass, which
/// turns them into `．`. The transform is idempotent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextPostprocessor;

impl TextPostprocessor {
    #[instrument(level = "debug", skip_all)]
    pub fn postprocess(&self, text: &str) -> String {
        let clean = text
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .replace(ELLIPSIS, "...");
        halfwidth_to_fullwidth(&collapse_dots(&clean))
    }
}

fn is_dot(ch: char) -> bool {
    ch == '.' || ch == KATAKANA_MIDDLE_DOT
}

/// Rewrites every run of two or more dots as the same number of ASCII periods. A lone
/// middle dot is punctuation in its own right and is kept.
fn collapse_dots(text: &str) -> String {
    fn flush(run: &mut String, out: &mut String) {
        if run.chars().count() >= 2 {
            out.extend(run.chars().map(|_| '.'));
        } else {
            out.push_str(run);
        }
        run.clear();
    }

    let mut out = String::with_capacity(text.len());
    let mut run = String::new();
    for ch in text.chars() {
        if is_dot(ch) {
            run.push(ch);
        } else {
            flush(&mut run, &mut out);
            out.push(ch);
        }
    }
    flush(&mut run, &mut out);
    out
}

fn halfwidth_to_fullwidth(text: &str) -> String {
    text.chars()
        .map(|ch| match ch as u32 {
            code @ HALF_WIDTH_FIRST..=HALF_WIDTH_LAST => {
                FULL_WIDTH[(code - HALF_WIDTH_FIRST) as usize]
            }
            _ => ch,
        })
        .collect()
}
