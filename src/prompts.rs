//! Oracle prompts for layout classification and product extraction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — changing extraction behaviour (e.g. the
//!    positional size-mapping rule) requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect prompts directly without a
//!    live oracle, making prompt regressions easy to catch.
//!
//! Strategy-specific instruction blocks are rendered by
//! [`crate::pipeline::strategy`] and spliced in by the builder functions
//! below.

/// Prompt for the visual layout-classification call (one per document).
///
/// The oracle must answer with a JSON object matching
/// [`crate::pipeline::layout::VisualSignal`].
pub const LAYOUT_CLASSIFICATION_PROMPT: &str = r#"# VISUAL LAYOUT ANALYSIS

Analyse this commercial order document page and identify its structural pattern.

## LAYOUT PATTERNS TO DETECT:

1. GRID_TABULAR: data organised in a clear grid with rows and columns,
   visible headers, well-defined cells.
2. LIST_VERTICAL: items stacked vertically, each line a complete item.
3. LIST_HORIZONTAL: data flows left to right in horizontal groupings.
4. HYBRID_MIXED: some sections tabular, others list-like.
5. FORM_FIELDS: label/value form structure.
6. FREE_TEXT: paragraphs without tabular organisation.

## STRUCTURAL ELEMENTS TO IDENTIFY:
- Dividing lines, element alignment, repetitive patterns
- Organisation of numbers/codes, data density, visual consistency

Respond with JSON only:
```json
{
  "primary_layout": "GRID_TABULAR|LIST_VERTICAL|LIST_HORIZONTAL|HYBRID_MIXED|FORM_FIELDS|FREE_TEXT",
  "confidence": 0.0,
  "structural_elements": {
    "has_clear_grid": false,
    "has_headers": false,
    "has_dividing_lines": false,
    "alignment_quality": "high|medium|low",
    "data_density": "high|medium|low",
    "repetitive_patterns": false
  },
  "extraction_hints": {
    "best_approach": "table_scan|line_by_line|section_by_section|adaptive",
    "complexity_level": "simple|moderate|complex"
  }
}
```"#;

/// The JSON shape every extraction prompt asks for.
pub const JSON_TEMPLATE: &str = r#"{
  "products": [
    {
      "name": "Product name",
      "material_code": "Unique identifier code (REQUIRED)",
      "category": "Category",
      "model": "Model",
      "composition": "100% cotton",
      "colors": [
        {
          "color_code": "807",
          "color_name": "Blue",
          "sizes": [
            {"size": "S", "quantity": 1},
            {"size": "M", "quantity": 2}
          ],
          "unit_price": 79.00,
          "sales_price": 119.00,
          "subtotal": 474.00
        }
      ],
      "total_price": 474.00
    }
  ],
  "order_info": {
    "supplier": null,
    "order_number": null,
    "total_pieces": 122,
    "total_value": 9983.00
  }
}"#;

/// Positional size-mapping rules shared by every extraction prompt.
///
/// The single most common oracle mistake is pairing a quantity with the
/// wrong size column, so the rule gets its own prominent block.
const SIZE_MAPPING_RULES: &str = r#"## CRITICAL RULES FOR SIZES:

POSITIONAL MAPPING: when sizes appear in one row and quantities in another:

```
XS   S    M    L    XL   XXL
     1    1    1
```
→ interpret as: S=1, M=1, L=1 (XS, XL, XXL have no quantity = DO NOT include)

ALGORITHM:
1. Identify the row holding size labels
2. Locate the row holding quantities (usually the next one)
3. Map by position: a quantity belongs to the size in the same column
4. Include ONLY sizes with quantity > 0
5. Ignore empty cells and zero quantities

## COMMON PRODUCT CODE PATTERNS:
- Alphanumeric: CF5015E0624, AB123456, T3216
- Long numeric: 50469055, 23411201
- Hybrid: MA82O, MS55N, T054A"#;

/// Shared tail of every extraction prompt: field list + output contract.
const EXTRACTION_TASK: &str = r#"## Extraction Task
Analyse this page and extract every product visible on it, following the
layout and strategy guidance above.

For each product extract:
- Product name
- Material code: identify via the patterns above OR the detected header column
- Category, model, composition (when available)
- For EACH colour of the product:
  * colour code, colour name (when available)
  * available sizes and their quantities
  * unit price, sales price (when available), subtotal for this colour

## Critical Rules:
1. Extract ONLY what is visible on this specific page
2. Include ONLY sizes with explicitly indicated quantities
3. Do NOT include sizes with empty cells or zero quantity
4. Use null for missing fields but keep the JSON structure
5. Do NOT invent data or add products that are not clearly on the image

## Response Format
Return the extracted data as strict JSON:"#;

/// Build the extraction prompt for the first page.
///
/// `context` carries the rendered layout + strategy instruction blocks.
pub fn first_page_prompt(context: &str, page_number: usize, total_pages: usize) -> String {
    format!(
        "# PRODUCT EXTRACTION INSTRUCTIONS\n\n\
         You are an expert at extracting product data from commercial order documents.\n\
         This is page {page_number} of {total_pages}.\n\n\
         {context}\n\n\
         {SIZE_MAPPING_RULES}\n\n\
         {EXTRACTION_TASK}\n\n\
         ```json\n{JSON_TEMPLATE}\n```"
    )
}

/// Build the extraction prompt for pages after the first.
///
/// Mentions how many products were already found so the oracle does not
/// re-report items from earlier pages it cannot see anyway, and keeps the
/// established structure in mind.
pub fn additional_page_prompt(
    context: &str,
    page_number: usize,
    total_pages: usize,
    previous_products: usize,
) -> String {
    format!(
        "# PRODUCT EXTRACTION INSTRUCTIONS (CONTINUATION)\n\n\
         You are an expert at extracting product data from commercial order documents.\n\
         This is page {page_number} of {total_pages}. \
         {previous_products} products were already extracted from earlier pages; \
         extract only what THIS page shows.\n\n\
         {context}\n\n\
         {SIZE_MAPPING_RULES}\n\n\
         {EXTRACTION_TASK}\n\n\
         ```json\n{JSON_TEMPLATE}\n```"
    )
}

/// Block appended to the next page's context after a strategy switch.
pub fn strategy_change_block(page_number: usize, strategy_name: &str, instructions: &str) -> String {
    format!(
        "\n## STRATEGY ADAPTED FOR PAGE {page_number}\n\n\
         STRATEGY CHANGE: previous results were unsatisfactory.\n\
         - New strategy: {strategy_name}\n\
         - Apply the updated instructions below:\n\n\
         {instructions}\n"
    )
}

// ── Corrective re-extraction prompts ─────────────────────────────────────

/// Which corrective angle the validation layer picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectiveFocus {
    /// Size/quantity alignment problems dominate.
    SizesAndQuantities,
    /// Duplicate/per-colour-split products dominate.
    Grouping,
    /// Nothing specific — conservative re-read.
    Conservative,
}

/// Build a corrective re-extraction prompt for one page.
pub fn corrective_prompt(focus: CorrectiveFocus, page_number: usize, total_pages: usize) -> String {
    let focus_block = match focus {
        CorrectiveFocus::SizesAndQuantities => {
            "## FOCUS: SIZES AND QUANTITIES\n\
             The previous extraction had misaligned sizes/quantities.\n\
             - Re-read every size row and quantity row carefully\n\
             - Map quantities to sizes STRICTLY by column position\n\
             - A size with an empty cell has NO quantity: leave it out\n\
             - Quantities are rarely all equal to 1 — re-check any uniform run"
        }
        CorrectiveFocus::Grouping => {
            "## FOCUS: PRODUCT GROUPING\n\
             The previous extraction split one product into several entries.\n\
             - One material code = ONE product, with one colour entry per colour\n\
             - Do not create a separate product per colour or per size\n\
             - Group every colour of the same code under that code"
        }
        CorrectiveFocus::Conservative => {
            "## FOCUS: CONSERVATIVE RE-READ\n\
             Extract ONLY data you are certain about:\n\
             - Material codes clearly visible on the page\n\
             - Colours and sizes with explicit quantities\n\
             - When uncertain, leave the field null instead of guessing"
        }
    };

    format!(
        "# CORRECTIVE RE-EXTRACTION — PAGE {page_number} OF {total_pages}\n\n\
         {focus_block}\n\n\
         {SIZE_MAPPING_RULES}\n\n\
         ## Response Format\n\
         Return strict JSON:\n\n\
         ```json\n{JSON_TEMPLATE}\n```"
    )
}
